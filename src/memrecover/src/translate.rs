//! Virtual to physical translation for a captured process
//!
//! Two address-space models are supported:
//! - x86-64 4-level page tables rooted at the process's PGD
//! - explicit linear runs, for captures that record where each virtual range
//!   was written (gcore/minidump style region tables)

use serde::{Deserialize, Serialize};

use crate::image::PhysicalMemory;
use crate::{Error, Result};

/// Physical frame bits of a page-table entry
const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const PRESENT: u64 = 1 << 0;
const PAGE_SIZE_BIT: u64 = 1 << 7;

const PML4_SHIFT: u32 = 39;
const PDPT_SHIFT: u32 = 30;
const PD_SHIFT: u32 = 21;
const PT_SHIFT: u32 = 12;

/// One contiguous virtual range stored at a known physical offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinearRun {
    pub virt_start: u64,
    pub len: u64,
    pub phys_start: u64,
}

impl LinearRun {
    pub fn virt_end(&self) -> u64 {
        self.virt_start + self.len
    }
}

/// How a process's virtual addresses reach the image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSpace {
    /// Physical address of the top-level (PML4) table
    PageTable { root: u64 },
    /// Sorted, non-overlapping runs
    Linear { runs: Vec<LinearRun> },
}

/// Result of translating one virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// `run` bytes starting at `physical` back the virtual range starting at the query
    Mapped { physical: u64, run: u64 },
    /// The next `run` bytes have no resident backing
    NotResident { run: u64 },
}

impl AddressSpace {
    /// Build a linear space, sorting runs and rejecting overlaps
    pub fn linear(mut runs: Vec<LinearRun>) -> Result<Self> {
        runs.retain(|r| r.len > 0);
        runs.sort_by_key(|r| r.virt_start);
        for pair in runs.windows(2) {
            if pair[0].virt_end() > pair[1].virt_start {
                return Err(Error::InvalidInput(format!(
                    "linear runs overlap at {:#x}",
                    pair[1].virt_start
                )));
            }
        }
        Ok(AddressSpace::Linear { runs })
    }

    pub fn translate(&self, memory: &dyn PhysicalMemory, va: u64) -> Result<Translation> {
        match self {
            AddressSpace::PageTable { root } => walk_page_tables(memory, *root, va),
            AddressSpace::Linear { runs } => Ok(translate_linear(runs, va)),
        }
    }
}

fn translate_linear(runs: &[LinearRun], va: u64) -> Translation {
    let idx = runs.partition_point(|r| r.virt_start <= va);

    if let Some(run) = idx.checked_sub(1).and_then(|i| runs.get(i)) {
        if va < run.virt_end() {
            return Translation::Mapped {
                physical: run.phys_start + (va - run.virt_start),
                run: run.virt_end() - va,
            };
        }
    }

    let run = match runs.get(idx) {
        Some(next) => next.virt_start - va,
        None => u64::MAX - va,
    };
    Translation::NotResident { run: run.max(1) }
}

/// Bytes from `va` to the end of the region covered by one entry at `shift`
fn span_remaining(va: u64, shift: u32) -> u64 {
    let size = 1u64 << shift;
    size - (va & (size - 1))
}

fn table_index(va: u64, shift: u32) -> u64 {
    (va >> shift) & 0x1ff
}

fn walk_page_tables(memory: &dyn PhysicalMemory, root: u64, va: u64) -> Result<Translation> {
    let mut table = root & ADDRESS_MASK;

    for shift in [PML4_SHIFT, PDPT_SHIFT, PD_SHIFT, PT_SHIFT] {
        let entry_addr = table + table_index(va, shift) * 8;

        let entry = match memory.read_u64(entry_addr) {
            Ok(entry) => entry,
            // The table page itself was not captured: everything the parent
            // entry covers is unknown
            Err(Error::AbsentPage { .. }) => {
                return Ok(Translation::NotResident {
                    run: span_remaining(va, (shift + 9).min(48)),
                })
            }
            Err(e) => return Err(e),
        };

        if entry & PRESENT == 0 {
            return Ok(Translation::NotResident {
                run: span_remaining(va, shift),
            });
        }

        let is_leaf = shift == PT_SHIFT
            || ((shift == PDPT_SHIFT || shift == PD_SHIFT) && entry & PAGE_SIZE_BIT != 0);

        if is_leaf {
            let page_mask = (1u64 << shift) - 1;
            let frame = entry & ADDRESS_MASK & !page_mask;
            return Ok(Translation::Mapped {
                physical: frame | (va & page_mask),
                run: span_remaining(va, shift),
            });
        }

        table = entry & ADDRESS_MASK;
    }

    unreachable!("the PT level always yields a leaf")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageFormat, ImageOptions, MemoryImage};
    use byteorder::{ByteOrder, LE};

    fn put(mem: &mut [u8], at: u64, value: u64) {
        LE::write_u64(&mut mem[at as usize..at as usize + 8], value);
    }

    /// PML4 at 0x1000, PDPT at 0x2000, PD at 0x3000, PT at 0x4000.
    fn build_tables() -> Vec<u8> {
        let mut mem = vec![0u8; 0x40_0000];
        let va: u64 = 0x7f00_0020_0000;

        put(&mut mem, 0x1000 + table_index(va, PML4_SHIFT) * 8, 0x2000 | PRESENT);
        put(&mut mem, 0x2000 + table_index(va, PDPT_SHIFT) * 8, 0x3000 | PRESENT);
        put(&mut mem, 0x3000 + table_index(va, PD_SHIFT) * 8, 0x4000 | PRESENT);
        // First 4K page -> frame 0x9000, second page not present
        put(&mut mem, 0x4000 + table_index(va, PT_SHIFT) * 8, 0x9000 | PRESENT);

        // A 2M large page for the next PD slot -> frame 0x20_0000
        let large_va = va + 0x20_0000;
        put(
            &mut mem,
            0x3000 + table_index(large_va, PD_SHIFT) * 8,
            0x20_0000 | PRESENT | PAGE_SIZE_BIT,
        );

        mem[0x9010] = 0x42;
        mem
    }

    fn image(mem: Vec<u8>, absent: Vec<(u64, u64)>) -> MemoryImage {
        let options = ImageOptions {
            absent,
            ..ImageOptions::default()
        };
        MemoryImage::from_bytes(mem, ImageFormat::Raw, &options).unwrap()
    }

    #[test]
    fn test_four_level_walk() {
        let image = image(build_tables(), vec![]);
        let space = AddressSpace::PageTable { root: 0x1000 };

        let t = space.translate(&image, 0x7f00_0020_0010).unwrap();
        assert_eq!(
            t,
            Translation::Mapped {
                physical: 0x9010,
                run: 0xff0
            }
        );
        assert_eq!(image.read(0x9010, 1).unwrap(), vec![0x42]);
    }

    #[test]
    fn test_not_present_pte() {
        let image = image(build_tables(), vec![]);
        let space = AddressSpace::PageTable { root: 0x1000 };

        let t = space.translate(&image, 0x7f00_0020_1008).unwrap();
        assert_eq!(t, Translation::NotResident { run: 0xff8 });
    }

    #[test]
    fn test_large_page() {
        let image = image(build_tables(), vec![]);
        let space = AddressSpace::PageTable { root: 0x1000 };

        let t = space.translate(&image, 0x7f00_0040_1234).unwrap();
        assert_eq!(
            t,
            Translation::Mapped {
                physical: 0x20_1234,
                run: 0x20_0000 - 0x1234
            }
        );
    }

    #[test]
    fn test_absent_table_page_is_not_resident() {
        let image = image(build_tables(), vec![(0x4000, 0x5000)]);
        let space = AddressSpace::PageTable { root: 0x1000 };

        let t = space.translate(&image, 0x7f00_0020_0010).unwrap();
        assert_eq!(t, Translation::NotResident { run: 0x20_0000 - 0x10 });
    }

    #[test]
    fn test_linear_runs() {
        let space = AddressSpace::linear(vec![
            LinearRun {
                virt_start: 0x5000,
                len: 0x1000,
                phys_start: 0x100,
            },
            LinearRun {
                virt_start: 0x1000,
                len: 0x2000,
                phys_start: 0x8000,
            },
        ])
        .unwrap();
        let image = image(vec![0u8; 0x1_0000], vec![]);

        assert_eq!(
            space.translate(&image, 0x1800).unwrap(),
            Translation::Mapped {
                physical: 0x8800,
                run: 0x1800
            }
        );
        assert_eq!(
            space.translate(&image, 0x3000).unwrap(),
            Translation::NotResident { run: 0x2000 }
        );
        assert_eq!(
            space.translate(&image, 0x5fff).unwrap(),
            Translation::Mapped {
                physical: 0x10ff,
                run: 1
            }
        );
    }

    #[test]
    fn test_linear_overlap_rejected() {
        let result = AddressSpace::linear(vec![
            LinearRun {
                virt_start: 0x1000,
                len: 0x2000,
                phys_start: 0,
            },
            LinearRun {
                virt_start: 0x2000,
                len: 0x1000,
                phys_start: 0x4000,
            },
        ]);
        assert!(result.is_err());
    }
}
