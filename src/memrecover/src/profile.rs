//! Kernel Profile
//!
//! Structure layouts for the kernel that produced the capture. These come from
//! an external symbol-resolution step (debug info for the exact kernel build);
//! this crate only consumes the resolved offsets.

use serde::{Deserialize, Serialize};

use crate::input::{de_opt_u64, de_u64};
use crate::{Error, Result};

/// How a process's memory areas are linked from its `mm_struct`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmaLinkage {
    /// `mm->mmap` list chained through `vm_next`
    #[default]
    List,
    /// `mm->mm_rb` red-black tree of `vm_rb` nodes
    RbTree,
}

/// `task_struct` field offsets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOffsets {
    /// `tasks` list_head
    pub tasks: u64,
    pub pid: u64,
    pub comm: u64,
    pub mm: u64,
}

/// `mm_struct` field offsets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmOffsets {
    pub mmap: u64,
    pub mm_rb: u64,
    pub pgd: u64,
}

/// `vm_area_struct` field offsets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmaOffsets {
    pub vm_start: u64,
    pub vm_end: u64,
    pub vm_next: u64,
    /// Embedded `rb_node`; left/right children follow the parent-color word
    pub vm_rb: u64,
    pub vm_flags: u64,
    pub vm_pgoff: u64,
    pub vm_file: u64,
}

/// `struct file` / `struct dentry` offsets used to name backing files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOffsets {
    /// `f_path.dentry`
    pub f_dentry: u64,
    /// `d_name.name` pointer
    pub d_name: u64,
    pub d_parent: u64,
}

/// `vm_flags` bits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmFlagBits {
    pub read: u64,
    pub write: u64,
    pub exec: u64,
    pub shared: u64,
}

impl Default for VmFlagBits {
    fn default() -> Self {
        Self {
            read: 0x1,
            write: 0x2,
            exec: 0x4,
            shared: 0x8,
        }
    }
}

/// Upper bounds on walk length, for corrupted lists that never revisit a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkLimits {
    pub max_tasks: usize,
    pub max_vmas: usize,
    pub max_path_depth: usize,
}

impl Default for WalkLimits {
    fn default() -> Self {
        Self {
            max_tasks: 1 << 16,
            max_vmas: 1 << 16,
            max_path_depth: 64,
        }
    }
}

/// Everything the kernel walk needs to know about the captured kernel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelProfile {
    /// Kernel virtual address at which physical memory is linearly mapped
    #[serde(deserialize_with = "de_u64")]
    pub direct_map_base: u64,

    /// Physical offset of `init_task`
    #[serde(deserialize_with = "de_u64")]
    pub init_task: u64,

    /// Kernel page size, used to turn `vm_pgoff` into a byte offset
    #[serde(default = "default_kernel_page_size")]
    pub page_size: u64,

    /// Overrides `mm->pgd` (e.g. a CR3 value captured alongside the image)
    #[serde(default, deserialize_with = "de_opt_u64")]
    pub dtb: Option<u64>,

    pub task: TaskOffsets,
    pub mm: MmOffsets,
    pub vma: VmaOffsets,
    pub file: FileOffsets,

    #[serde(default)]
    pub vma_linkage: VmaLinkage,

    #[serde(default)]
    pub flags: VmFlagBits,

    #[serde(default)]
    pub limits: WalkLimits,
}

fn default_kernel_page_size() -> u64 {
    0x1000
}

impl KernelProfile {
    /// Translate a direct-map kernel pointer into a physical handle
    pub fn kva_to_phys(&self, kva: u64) -> Option<u64> {
        kva.checked_sub(self.direct_map_base)
    }

    /// Translate a physical handle back into its direct-map address
    pub fn phys_to_kva(&self, phys: u64) -> u64 {
        self.direct_map_base.wrapping_add(phys)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(Error::InvalidProfile(format!(
                "page size {:#x} is not a power of two",
                self.page_size
            )));
        }
        let bits = &self.flags;
        if bits.read & bits.write != 0 || bits.read & bits.exec != 0 || bits.write & bits.exec != 0
        {
            return Err(Error::InvalidProfile("vm_flags bits overlap".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILE_YAML: &str = r#"
direct_map_base: "0xffff888000000000"
init_task: 0x100000
task: { tasks: 0x10, pid: 0x20, comm: 0x28, mm: 0x38 }
mm: { mmap: 0x0, mm_rb: 0x8, pgd: 0x10 }
vma:
  vm_start: 0x0
  vm_end: 0x8
  vm_next: 0x10
  vm_rb: 0x18
  vm_flags: 0x30
  vm_pgoff: 0x38
  vm_file: 0x40
file: { f_dentry: 0x8, d_name: 0x10, d_parent: 0x18 }
vma_linkage: rb_tree
"#;

    #[test]
    fn test_profile_from_yaml() {
        let profile: KernelProfile = serde_yaml::from_str(PROFILE_YAML).unwrap();
        assert_eq!(profile.direct_map_base, 0xffff_8880_0000_0000);
        assert_eq!(profile.init_task, 0x10_0000);
        assert_eq!(profile.page_size, 0x1000);
        assert_eq!(profile.vma_linkage, VmaLinkage::RbTree);
        assert_eq!(profile.flags.exec, 0x4);
        assert!(profile.dtb.is_none());
        profile.validate().unwrap();
    }

    #[test]
    fn test_direct_map_translation() {
        let profile: KernelProfile = serde_yaml::from_str(PROFILE_YAML).unwrap();
        assert_eq!(profile.kva_to_phys(0xffff_8880_0000_2000), Some(0x2000));
        assert_eq!(profile.kva_to_phys(0x1000), None);
        assert_eq!(profile.phys_to_kva(0x2000), 0xffff_8880_0000_2000);
    }

    #[test]
    fn test_overlapping_flag_bits_rejected() {
        let mut profile: KernelProfile = serde_yaml::from_str(PROFILE_YAML).unwrap();
        profile.flags.write = profile.flags.read;
        assert!(matches!(profile.validate(), Err(Error::InvalidProfile(_))));
    }
}
