//! # memrecover
//!
//! Recover serialized model archives (metadata, weights, bytecode) from a
//! physical memory capture of the process that held them.
//!
//! The pipeline runs strictly bottom-up:
//!
//! 1. [`image`] - read-only access to the capture, with a presence map of
//!    pages that were never captured
//! 2. [`vma`] - the target process's virtual memory areas, walked out of the
//!    kernel's own bookkeeping (or parsed from a saved `/proc/<pid>/maps`)
//! 3. [`correlate`] - binds ground-truth addresses from a live debugging
//!    session to VMAs
//! 4. [`extract`] - copies virtual ranges out of the image, marking pages that
//!    are absent instead of inventing bytes
//! 5. [`archive`] - stitches segments into streams and cuts them into the
//!    named entries of a caller-described container format
//! 6. [`report`] - cross-references everything into a recovery report
//!
//! Only [`archive`] knows about container layouts; the lower layers work for
//! any file-backed mapping.
//!
//! ## Example
//!
//! ```no_run
//! use memrecover::{
//!     ContainerSpec, GroundTruthAddress, ImageOptions, KernelProfile, MemoryImage, Pipeline,
//!     PipelineInputs, ProcessSelector, TagMap,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let image = MemoryImage::open("capture.lime", &ImageOptions::default())?;
//! let profile: KernelProfile = memrecover::input::load_document("profile.yaml")?;
//! let ground_truth: Vec<GroundTruthAddress> = memrecover::input::load_document("gt.yaml")?;
//! let container: ContainerSpec = memrecover::input::load_document("container.yaml")?;
//!
//! let output = Pipeline::new(&image).run(&PipelineInputs {
//!     source: memrecover::pipeline::ProcessSource::Kernel {
//!         profile,
//!         selector: ProcessSelector::Pid(4242),
//!     },
//!     ground_truth,
//!     container,
//!     tags: TagMap::default(),
//! })?;
//!
//! println!("{:?}", output.report.outcome);
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod correlate;
pub mod extract;
pub mod image;
pub mod input;
pub mod pipeline;
pub mod process;
pub mod profile;
pub mod report;
pub mod translate;
pub mod vma;

#[doc(inline)]
pub use archive::{
    reconstruct, ArchiveEntry, ArchiveOutcome, Completeness, ContainerSpec, EntrySpec, LengthRule,
    ReconstructedArchive,
};
#[doc(inline)]
pub use correlate::{correlate, correlate_all, Correlation, CorrelationResult, GroundTruthAddress};
#[doc(inline)]
pub use extract::{extract, extract_many, PresenceVector, Segment, ABSENT_FILL};
#[doc(inline)]
pub use image::{ImageFormat, ImageOptions, MemoryImage, PhysicalMemory, PresenceMap};
#[doc(inline)]
pub use pipeline::{Pipeline, PipelineInputs, PipelineOutput};
#[doc(inline)]
pub use process::{ProcessContext, ProcessSelector};
#[doc(inline)]
pub use profile::KernelProfile;
#[doc(inline)]
pub use report::{summarize, RecoveryReport, TagMap};
#[doc(inline)]
pub use translate::{AddressSpace, LinearRun, Translation};
#[doc(inline)]
pub use vma::{Backing, Permissions, VmaEntry, VmaIndex};

/// Errors produced by the recovery pipeline.
///
/// `OutOfRange`, `ProcessNotFound` and `InvalidImage` abort a run. `AbsentPage`
/// and `MalformedContainer` are data-quality conditions that the pipeline
/// records on its results instead of propagating.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("read of {len} bytes at physical offset {offset:#x} exceeds image size {size:#x}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("physical page {page:#x} is absent from the image")]
    AbsentPage { page: u64 },

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("malformed container entry '{entry}': {reason}")]
    MalformedContainer { entry: String, reason: String },

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("invalid kernel profile: {0}")]
    InvalidProfile(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for the non-fatal "page not captured" condition.
    pub fn is_absent(&self) -> bool {
        matches!(self, Error::AbsentPage { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_is_distinguishable() {
        assert!(Error::AbsentPage { page: 0x1000 }.is_absent());
        assert!(!Error::OutOfRange {
            offset: 0,
            len: 1,
            size: 0
        }
        .is_absent());
    }

    #[test]
    fn test_error_messages_name_offsets() {
        let err = Error::OutOfRange {
            offset: 0x2000,
            len: 16,
            size: 0x1000,
        };
        assert_eq!(
            err.to_string(),
            "read of 16 bytes at physical offset 0x2000 exceeds image size 0x1000"
        );
    }
}
