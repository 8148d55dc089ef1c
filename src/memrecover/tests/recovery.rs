//! End-to-end recovery over synthetic captures with explicit region tables

mod common;

use common::{filler, model_file, MODEL_CONTAINER};
use memrecover::image::{ImageFormat, ImageOptions};
use memrecover::pipeline::ProcessSource;
use memrecover::vma::parse_maps;
use memrecover::{
    AddressSpace, ArchiveOutcome, Backing, Completeness, ContainerSpec, GroundTruthAddress,
    LinearRun, MemoryImage, Permissions, Pipeline, PipelineInputs, PipelineOutput, ProcessContext,
    TagMap, VmaEntry, VmaIndex,
};

/// The model file stored at physical 0x1000 and mapped at 0x1000
fn model_image(page_size: u64, absent: Vec<(u64, u64)>) -> MemoryImage {
    let mut mem = vec![0u8; 0x4000];
    mem[0x1000..0x3000].copy_from_slice(&model_file());
    let options = ImageOptions {
        page_size,
        absent,
        ..ImageOptions::default()
    };
    MemoryImage::from_bytes(mem, ImageFormat::Raw, &options).unwrap()
}

fn model_source() -> ProcessSource {
    let space = AddressSpace::linear(vec![LinearRun {
        virt_start: 0x1000,
        len: 0x2000,
        phys_start: 0x1000,
    }])
    .unwrap();
    let index = VmaIndex::from_entries(vec![VmaEntry::new(
        0x1000,
        0x3000,
        Permissions::new(Permissions::READ),
        Backing::File {
            path: "/srv/models/net.pt".into(),
            offset: 0,
        },
    )]);
    ProcessSource::Prepared {
        process: ProcessContext::from_parts(4242, "infer", space),
        index,
    }
}

fn tags() -> TagMap {
    [("module object", "metadata"), ("weight tensor storage", "weights")]
        .into_iter()
        .collect()
}

fn run(image: &MemoryImage, ground_truth: Vec<GroundTruthAddress>) -> PipelineOutput {
    Pipeline::new(image)
        .run(&PipelineInputs {
            source: model_source(),
            ground_truth,
            container: serde_yaml::from_str(MODEL_CONTAINER).unwrap(),
            tags: tags(),
        })
        .unwrap()
}

fn module_object() -> GroundTruthAddress {
    GroundTruthAddress::new(0x1010, "module object", Some(0x100))
}

#[test]
fn test_fully_resident_model_is_recovered() {
    let image = model_image(0x1000, vec![]);
    let output = run(&image, vec![module_object()]);

    let report = &output.report;
    assert_eq!(report.outcome, ArchiveOutcome::Recovered);
    assert_eq!(report.entry("metadata").unwrap().completeness_percent, 100.0);
    assert_eq!(report.entry("weights").unwrap().completeness_percent, 100.0);
    assert!(report.mismatches.is_empty());

    let segment = &output.segments[0];
    assert_eq!(segment.len(), 0x2000);
    assert!(segment.presence.is_complete());

    let addr = &report.addresses[0];
    assert!(addr.mapped);
    assert_eq!(addr.vmas[0].offset, 0x10);
    assert_eq!(addr.entry.as_deref(), Some("metadata"));
}

#[test]
fn test_absent_page_makes_metadata_partial() {
    // 0x80-byte pages; file offsets 0x80..0x100 were never captured
    let image = model_image(0x80, vec![(0x1080, 0x1100)]);
    let output = run(&image, vec![module_object()]);

    let segment = &output.segments[0];
    assert_eq!(segment.len(), 0x2000);
    assert_eq!(segment.presence.missing_bytes(), 0x80);

    let metadata = output.archive.entry("metadata").unwrap();
    assert_eq!(
        metadata.completeness,
        Completeness::Partial {
            gaps: vec![memrecover::extract::Gap {
                offset: 0x6c,
                len: 0x80
            }]
        }
    );
    assert_eq!(metadata.missing_bytes(), segment.presence.missing_bytes());
    assert_eq!(metadata.payload.len(), 0x100);

    let report = &output.report;
    let finding = report.entry("metadata").unwrap();
    assert!(finding.completeness_percent < 100.0);
    assert_eq!(finding.completeness_percent, 50.0);
    assert_eq!(report.entry("weights").unwrap().completeness_percent, 100.0);
    assert_eq!(report.outcome, ArchiveOutcome::Partial);
    assert_eq!(report.mismatches.len(), 1);
}

#[test]
fn test_unmapped_address_does_not_stop_recovery() {
    let image = model_image(0x1000, vec![]);
    let output = run(
        &image,
        vec![
            GroundTruthAddress::new(0x9000, "weight tensor storage", None),
            module_object(),
        ],
    );

    assert!(!output.correlations[0].is_mapped());
    assert!(output.correlations[1].is_mapped());
    assert_eq!(output.report.unmapped().count(), 1);
    assert_eq!(output.archive.outcome, ArchiveOutcome::Recovered);
}

#[test]
fn test_only_unmapped_addresses_is_unrecoverable() {
    let image = model_image(0x1000, vec![]);
    let output = run(
        &image,
        vec![GroundTruthAddress::new(0x9000, "module object", None)],
    );
    assert!(output.segments.is_empty());
    assert_eq!(output.report.outcome, ArchiveOutcome::Unrecoverable);
    assert_eq!(output.report.mismatches.len(), 1);
}

#[test]
fn test_pipeline_is_idempotent() {
    let image = model_image(0x80, vec![(0x1080, 0x1100)]);
    let first = run(&image, vec![module_object()]);
    let second = run(&image, vec![module_object()]);

    assert_eq!(first.archive, second.archive);
    assert_eq!(first.report, second.report);
    assert_eq!(
        serde_json::to_string(&first.report).unwrap(),
        serde_json::to_string(&second.report).unwrap()
    );
}

#[test]
fn test_marker_bytes_inside_metadata_do_not_move_weights() {
    let mut file = model_file();
    file[0x40..0x44].copy_from_slice(b"WGHT");

    let mut mem = vec![0u8; 0x4000];
    mem[0x1000..0x3000].copy_from_slice(&file);
    let image = MemoryImage::from_bytes(mem, ImageFormat::Raw, &ImageOptions::default()).unwrap();
    let output = run(&image, vec![module_object()]);

    assert_eq!(output.archive.outcome, ArchiveOutcome::Recovered);
    assert_eq!(
        output.archive.entry("metadata").unwrap().payload,
        file[0x14..0x114].to_vec()
    );
    assert_eq!(
        output.archive.entry("weights").unwrap().payload,
        file[0x124..0x624].to_vec()
    );

    let mut expected = file[0x10..0x114].to_vec();
    expected.extend_from_slice(&file[0x120..0x624]);
    assert_eq!(output.archive.to_container_bytes(), expected);
}

/// Archive split across two VMAs whose file offsets line up, stored in the
/// image in the opposite order of the file
#[test]
fn test_split_archive_round_trips() {
    let mut archive = Vec::new();
    archive.extend_from_slice(b"MODH");
    archive.extend_from_slice(&filler(0x200, 3));
    archive.extend_from_slice(b"WGHT");
    archive.extend_from_slice(&0x1000u32.to_le_bytes());
    archive.extend_from_slice(&filler(0x1000, 4));
    archive.extend_from_slice(b"BYTC");
    let rest = 0x2000 - archive.len();
    archive.extend_from_slice(&filler(rest, 5));
    assert_eq!(archive.len(), 0x2000);

    let mut mem = vec![0u8; 0x4000];
    mem[0x3000..0x4000].copy_from_slice(&archive[..0x1000]);
    mem[0x1000..0x2000].copy_from_slice(&archive[0x1000..]);
    let image = MemoryImage::from_bytes(mem, ImageFormat::Raw, &ImageOptions::default()).unwrap();

    let maps = parse_maps(
        "\
100000-101000 r--p 00000000 08:01 77 /srv/models/split.pt
200000-201000 r--p 00001000 08:01 77 /srv/models/split.pt
0x100000 0x101000 0x1000 0x3000
0x200000 0x201000 0x1000 0x1000
",
    )
    .unwrap();

    let container: ContainerSpec = serde_yaml::from_str(
        r#"
entries:
  - name: metadata
    marker: MODH
    length: { declared: 0x200 }
  - name: weights
    marker: WGHT
    length: { prefixed: { width: 4 } }
  - name: bytecode
    marker: BYTC
    length: until_next_marker
"#,
    )
    .unwrap();

    let output = Pipeline::new(&image)
        .run(&PipelineInputs {
            source: ProcessSource::Maps { maps, pid: 4242 },
            ground_truth: vec![GroundTruthAddress::new(0x200010, "weight tensor storage", None)],
            container,
            tags: tags(),
        })
        .unwrap();

    // The hit VMA pulls in the other area of the same file
    assert_eq!(output.segments.len(), 2);
    assert_eq!(output.archive.outcome, ArchiveOutcome::Recovered);
    assert_eq!(output.archive.to_container_bytes(), archive);

    let weights = output.archive.entry("weights").unwrap();
    let vmas: Vec<usize> = weights.provenance.iter().map(|p| p.vma).collect();
    assert_eq!(vmas, vec![0, 1]);
    assert!(output.report.mismatches.is_empty());
}

#[test]
fn test_lime_capture_from_disk() {
    let mut low = vec![0u8; 0x3000];
    low[0x1000..0x3000].copy_from_slice(&model_file());
    let data = memrecover::image::lime::encode(&[(0, low.as_slice())]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.lime");
    std::fs::write(&path, data).unwrap();

    let image = MemoryImage::open(&path, &ImageOptions::default()).unwrap();
    assert_eq!(image.format(), ImageFormat::Lime);

    let output = run(&image, vec![module_object()]);
    assert_eq!(output.report.outcome, ArchiveOutcome::Recovered);

    let written = output.archive.write_to_dir(dir.path().join("out")).unwrap();
    assert_eq!(written.len(), 3);
    assert_eq!(
        std::fs::read(&written[0]).unwrap(),
        model_file()[0x14..0x114].to_vec()
    );
}
