//! Synthetic capture builders shared by the integration tests

#![allow(dead_code)]

use byteorder::{ByteOrder, LE};
use memrecover::image::{ImageFormat, ImageOptions, MemoryImage};
use memrecover::profile::{
    FileOffsets, KernelProfile, MmOffsets, TaskOffsets, VmFlagBits, VmaLinkage, VmaOffsets,
    WalkLimits,
};

pub const DIRECT_MAP: u64 = 0xffff_8880_0000_0000;

pub const VM_READ: u64 = 0x1;
pub const VM_WRITE: u64 = 0x2;
pub const VM_EXEC: u64 = 0x4;

const TASK_SIZE: u64 = 0x100;
const MM_SIZE: u64 = 0x40;
const VMA_SIZE: u64 = 0x50;
const VM_RB: u64 = 0x18;

/// A physical memory image with a tiny kernel laid out in it
pub struct KernelImage {
    pub mem: Vec<u8>,
    next_free: u64,
    tasks: Vec<u64>,
    /// Last area appended to each mm's list, keyed by mm
    list_tails: Vec<(u64, u64)>,
    pub linkage: VmaLinkage,
}

impl KernelImage {
    /// `size` bytes of physical memory; kernel objects are allocated from 0x1000
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            next_free: 0x1000,
            tasks: Vec::new(),
            list_tails: Vec::new(),
            linkage: VmaLinkage::List,
        }
    }

    pub fn kva(phys: u64) -> u64 {
        DIRECT_MAP + phys
    }

    /// Bump-allocate zeroed physical memory
    pub fn alloc(&mut self, size: u64, align: u64) -> u64 {
        let at = self.next_free.div_ceil(align) * align;
        self.next_free = at + size;
        assert!(self.next_free <= 0x10_0000, "kernel area exhausted");
        at
    }

    pub fn put_u64(&mut self, at: u64, value: u64) {
        LE::write_u64(&mut self.mem[at as usize..at as usize + 8], value);
    }

    pub fn put_i32(&mut self, at: u64, value: i32) {
        LE::write_i32(&mut self.mem[at as usize..at as usize + 4], value);
    }

    pub fn put_bytes(&mut self, at: u64, bytes: &[u8]) {
        self.mem[at as usize..at as usize + bytes.len()].copy_from_slice(bytes);
    }

    pub fn profile(&self) -> KernelProfile {
        KernelProfile {
            direct_map_base: DIRECT_MAP,
            init_task: self.tasks.first().copied().unwrap_or(0),
            page_size: 0x1000,
            dtb: None,
            task: TaskOffsets {
                tasks: 0x10,
                pid: 0x20,
                comm: 0x30,
                mm: 0x40,
            },
            mm: MmOffsets {
                mmap: 0x00,
                mm_rb: 0x08,
                pgd: 0x10,
            },
            vma: VmaOffsets {
                vm_start: 0x00,
                vm_end: 0x08,
                vm_next: 0x10,
                vm_rb: VM_RB,
                vm_flags: 0x30,
                vm_pgoff: 0x38,
                vm_file: 0x40,
            },
            file: FileOffsets {
                f_dentry: 0x00,
                d_name: 0x08,
                d_parent: 0x10,
            },
            vma_linkage: self.linkage,
            flags: VmFlagBits::default(),
            limits: WalkLimits::default(),
        }
    }

    /// Add a task; call [`KernelImage::link_tasks`] once all are added
    pub fn add_task(&mut self, pid: i32, comm: &str, mm: Option<u64>) -> u64 {
        let task = self.alloc(TASK_SIZE, 0x40);
        self.put_i32(task + 0x20, pid);
        let mut name = comm.as_bytes().to_vec();
        name.truncate(15);
        self.put_bytes(task + 0x30, &name);
        self.put_u64(task + 0x40, mm.map(Self::kva).unwrap_or(0));
        self.tasks.push(task);
        task
    }

    /// Close the tasks into a circular list in insertion order
    pub fn link_tasks(&mut self) {
        let n = self.tasks.len();
        for i in 0..n {
            let task = self.tasks[i];
            let next = self.tasks[(i + 1) % n];
            let prev = self.tasks[(i + n - 1) % n];
            self.put_u64(task + 0x10, Self::kva(next + 0x10));
            self.put_u64(task + 0x18, Self::kva(prev + 0x10));
        }
    }

    /// Overwrite a task's `tasks.next` with a raw value
    pub fn set_task_next(&mut self, task: u64, raw: u64) {
        self.put_u64(task + 0x10, raw);
    }

    pub fn add_mm(&mut self, pgd: u64) -> u64 {
        let mm = self.alloc(MM_SIZE, 0x40);
        self.put_u64(mm + 0x10, Self::kva(pgd));
        mm
    }

    /// Build a `struct file` whose dentry chain spells `path`
    pub fn add_file(&mut self, path: &str) -> u64 {
        let root = self.add_dentry("/", None);
        let mut parent = root;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            parent = self.add_dentry(component, Some(parent));
        }
        let file = self.alloc(0x20, 0x10);
        self.put_u64(file, Self::kva(parent));
        file
    }

    fn add_dentry(&mut self, name: &str, parent: Option<u64>) -> u64 {
        let dentry = self.alloc(0x20, 0x10);
        let name_at = self.alloc(name.len() as u64 + 1, 1);
        self.put_bytes(name_at, name.as_bytes());
        self.put_u64(dentry + 0x08, Self::kva(name_at));
        // The root is its own parent
        self.put_u64(dentry + 0x10, Self::kva(parent.unwrap_or(dentry)));
        dentry
    }

    /// Append an area to `mm`'s `vm_next` list
    pub fn add_vma(
        &mut self,
        mm: u64,
        range: (u64, u64),
        flags: u64,
        pgoff: u64,
        file: Option<u64>,
    ) -> u64 {
        let vma = self.alloc(VMA_SIZE, 0x10);
        self.put_u64(vma, range.0);
        self.put_u64(vma + 0x08, range.1);
        self.put_u64(vma + 0x30, flags);
        self.put_u64(vma + 0x38, pgoff);
        self.put_u64(vma + 0x40, file.map(Self::kva).unwrap_or(0));

        match self.list_tails.iter_mut().find(|(m, _)| *m == mm) {
            Some((_, tail)) => {
                let prev = *tail;
                *tail = vma;
                self.put_u64(prev + 0x10, Self::kva(vma));
            }
            None => {
                self.list_tails.push((mm, vma));
                self.put_u64(mm, Self::kva(vma));
            }
        }
        vma
    }

    /// Hang `vmas` (sorted) off `mm` as a balanced red-black tree
    pub fn link_rb_tree(&mut self, mm: u64, vmas: &[u64]) {
        let root = self.link_subtree(vmas);
        self.put_u64(mm + 0x08, root.map(|v| Self::kva(v + VM_RB)).unwrap_or(0));
    }

    fn link_subtree(&mut self, vmas: &[u64]) -> Option<u64> {
        if vmas.is_empty() {
            return None;
        }
        let mid = vmas.len() / 2;
        let node = vmas[mid] + VM_RB;
        let left = self.link_subtree(&vmas[..mid]);
        let right = self.link_subtree(&vmas[mid + 1..]);
        self.put_u64(node + 0x08, right.map(|v| Self::kva(v + VM_RB)).unwrap_or(0));
        self.put_u64(node + 0x10, left.map(|v| Self::kva(v + VM_RB)).unwrap_or(0));
        Some(vmas[mid])
    }

    /// Allocate an empty page-table root
    pub fn new_page_tables(&mut self) -> u64 {
        self.alloc(0x1000, 0x1000)
    }

    /// Map one 4K virtual page to a physical frame
    pub fn map_page(&mut self, root: u64, va: u64, frame: u64) {
        let mut table = root;
        for shift in [39u32, 30, 21] {
            let slot = table + ((va >> shift) & 0x1ff) * 8;
            let entry = LE::read_u64(&self.mem[slot as usize..slot as usize + 8]);
            table = if entry & 1 == 0 {
                let next = self.alloc(0x1000, 0x1000);
                self.put_u64(slot, next | 0x7);
                next
            } else {
                entry & 0x000F_FFFF_FFFF_F000
            };
        }
        let slot = table + ((va >> 12) & 0x1ff) * 8;
        self.put_u64(slot, frame | 0x7);
    }

    pub fn into_image(self, absent: Vec<(u64, u64)>) -> MemoryImage {
        let options = ImageOptions {
            absent,
            ..ImageOptions::default()
        };
        MemoryImage::from_bytes(self.mem, ImageFormat::Raw, &options).unwrap()
    }
}

/// Bytes that never contain an ASCII marker by accident
pub fn filler(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| 0x80 | ((i as u8).wrapping_add(seed) & 0x7f)).collect()
}

/// `MODH` + 0x100 metadata at 0x10, `WGHT` + 0x500 weights at 0x120
pub fn model_file() -> Vec<u8> {
    let mut file = vec![0u8; 0x2000];
    file[0x10..0x14].copy_from_slice(b"MODH");
    file[0x14..0x114].copy_from_slice(&filler(0x100, 1));
    file[0x120..0x124].copy_from_slice(b"WGHT");
    file[0x124..0x624].copy_from_slice(&filler(0x500, 2));
    file
}

pub const MODEL_CONTAINER: &str = r#"
max_stitch_gap: 0
entries:
  - name: metadata
    marker: MODH
    length: { declared: 0x100 }
  - name: weights
    marker: WGHT
    length: { declared: 0x500 }
"#;
