//! Kernel memory-area walk
//!
//! Areas hang off the `mm_struct` either as a `vm_next` list or as a red-black
//! tree of embedded `rb_node`s. Both are walked the same way: a worklist of
//! physical handles, each dereferenced through the image, with a visited set
//! keyed by handle so shared or cyclic links are followed once.

use std::collections::HashSet;

use super::{Backing, Permissions, VmaEntry};
use crate::image::PhysicalMemory;
use crate::profile::{KernelProfile, VmaLinkage};
use crate::Result;

/// Highest user-space address on x86-64 (exclusive)
const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// Longest dentry name read
const MAX_NAME_LEN: usize = 256;

/// `rb_node` layout: parent/color word, right child, left child
const RB_RIGHT: u64 = 8;
const RB_LEFT: u64 = 16;

/// Raw fields of one `vm_area_struct`
struct AreaRecord {
    start: u64,
    end: u64,
    flags: u64,
    pgoff: u64,
    file: u64,
}

fn read_area(
    memory: &dyn PhysicalMemory,
    profile: &KernelProfile,
    area: u64,
) -> Result<AreaRecord> {
    let o = &profile.vma;
    let field = |offset: u64| memory.read_u64(area.saturating_add(offset));
    Ok(AreaRecord {
        start: field(o.vm_start)?,
        end: field(o.vm_end)?,
        flags: field(o.vm_flags)?,
        pgoff: field(o.vm_pgoff)?,
        file: field(o.vm_file)?,
    })
}

/// Physical handle of a non-null kernel pointer
fn deref(profile: &KernelProfile, ptr: u64) -> Option<u64> {
    if ptr == 0 {
        None
    } else {
        profile.kva_to_phys(ptr)
    }
}

/// Handles of the areas linked from `area`
fn links(memory: &dyn PhysicalMemory, profile: &KernelProfile, area: u64) -> Result<Vec<u64>> {
    match profile.vma_linkage {
        VmaLinkage::List => {
            let next = memory.read_u64(area.saturating_add(profile.vma.vm_next))?;
            Ok(deref(profile, next).into_iter().collect())
        }
        VmaLinkage::RbTree => {
            let node = area.saturating_add(profile.vma.vm_rb);
            let mut children = Vec::with_capacity(2);
            for side in [RB_LEFT, RB_RIGHT] {
                let child = memory.read_u64(node.saturating_add(side))?;
                if let Some(handle) = rb_node_to_area(profile, child) {
                    children.push(handle);
                }
            }
            Ok(children)
        }
    }
}

fn rb_node_to_area(profile: &KernelProfile, node: u64) -> Option<u64> {
    deref(profile, node)?.checked_sub(profile.vma.vm_rb)
}

/// First area handle(s) reachable from the `mm_struct`
fn roots(memory: &dyn PhysicalMemory, profile: &KernelProfile, mm: u64) -> Result<Vec<u64>> {
    let root = match profile.vma_linkage {
        VmaLinkage::List => {
            let head = memory.read_u64(mm.saturating_add(profile.mm.mmap))?;
            deref(profile, head)
        }
        VmaLinkage::RbTree => {
            let node = memory.read_u64(mm.saturating_add(profile.mm.mm_rb))?;
            rb_node_to_area(profile, node)
        }
    };
    Ok(root.into_iter().collect())
}

fn permissions(profile: &KernelProfile, flags: u64) -> Permissions {
    let bits = &profile.flags;
    let mut perms = 0;
    if flags & bits.read != 0 {
        perms |= Permissions::READ;
    }
    if flags & bits.write != 0 {
        perms |= Permissions::WRITE;
    }
    if flags & bits.exec != 0 {
        perms |= Permissions::EXEC;
    }
    if flags & bits.shared != 0 {
        perms |= Permissions::SHARED;
    }
    Permissions::new(perms)
}

/// Build a path from a `struct file` by climbing `d_parent` to the root dentry
fn resolve_path(
    memory: &dyn PhysicalMemory,
    profile: &KernelProfile,
    file: u64,
) -> Result<Option<String>> {
    let offsets = &profile.file;
    let dentry_ptr = memory.read_u64(file.saturating_add(offsets.f_dentry))?;
    let Some(mut dentry) = deref(profile, dentry_ptr) else {
        return Ok(None);
    };

    let mut components: Vec<String> = Vec::new();
    let mut visited: HashSet<u64> = HashSet::new();

    while visited.insert(dentry) {
        if components.len() >= profile.limits.max_path_depth {
            return Ok(None);
        }

        let name_ptr = memory.read_u64(dentry.saturating_add(offsets.d_name))?;
        let parent_ptr = memory.read_u64(dentry.saturating_add(offsets.d_parent))?;

        // The root dentry is its own parent
        let Some(parent) = deref(profile, parent_ptr).filter(|&p| p != dentry) else {
            break;
        };

        if let Some(name) = deref(profile, name_ptr) {
            components.push(memory.read_cstring(name, MAX_NAME_LEN)?);
        }

        dentry = parent;
    }

    components.reverse();
    Ok(Some(format!("/{}", components.join("/"))))
}

fn validate(record: &AreaRecord, page_size: u64) -> std::result::Result<(), String> {
    if record.start >= record.end {
        return Err("start is not below end".into());
    }
    if record.start % page_size != 0 || record.end % page_size != 0 {
        return Err("bounds are not page aligned".into());
    }
    if record.end > USER_SPACE_END {
        return Err("range extends past user space".into());
    }
    Ok(())
}

/// Walk every area reachable from `mm`.
///
/// Never fails: returns the well-formed areas in discovery order and one
/// diagnostic per dropped or unreadable record.
pub(super) fn walk_areas(
    memory: &dyn PhysicalMemory,
    profile: &KernelProfile,
    mm: u64,
) -> (Vec<VmaEntry>, Vec<String>) {
    let mut areas = Vec::new();
    let mut diagnostics = Vec::new();

    let mut worklist = match roots(memory, profile, mm) {
        Ok(roots) => roots,
        Err(e) => {
            diagnostics.push(format!("mm_struct at {:#x} unreadable: {}", mm, e));
            return (areas, diagnostics);
        }
    };
    let mut visited: HashSet<u64> = HashSet::new();

    while let Some(handle) = worklist.pop() {
        if !visited.insert(handle) {
            diagnostics.push(format!("area {:#x} linked more than once", handle));
            continue;
        }
        if visited.len() > profile.limits.max_vmas {
            diagnostics.push(format!("area walk stopped after {} areas", profile.limits.max_vmas));
            break;
        }

        match links(memory, profile, handle) {
            Ok(next) => worklist.extend(next),
            Err(e) => diagnostics.push(format!("area {:#x}: links unreadable: {}", handle, e)),
        }

        let record = match read_area(memory, profile, handle) {
            Ok(record) => record,
            Err(e) => {
                diagnostics.push(format!("area {:#x} unreadable: {}", handle, e));
                continue;
            }
        };

        if let Err(reason) = validate(&record, profile.page_size) {
            tracing::warn!(area = format_args!("{:#x}", handle), %reason, "dropping malformed area");
            diagnostics.push(format!(
                "dropped area {:#x} ({:#x}-{:#x}): {}",
                handle, record.start, record.end, reason
            ));
            continue;
        }

        let backing = match deref(profile, record.file) {
            None => Backing::Anonymous { label: None },
            Some(file) => {
                let path = match resolve_path(memory, profile, file) {
                    Ok(Some(path)) => path,
                    Ok(None) => format!("<file {:#x}>", record.file),
                    Err(e) => {
                        diagnostics.push(format!(
                            "area {:#x}-{:#x}: backing file name unreadable: {}",
                            record.start, record.end, e
                        ));
                        format!("<file {:#x}>", record.file)
                    }
                };
                Backing::File {
                    path,
                    offset: record.pgoff.saturating_mul(profile.page_size),
                }
            }
        };

        tracing::debug!(
            start = format_args!("{:#x}", record.start),
            end = format_args!("{:#x}", record.end),
            %backing,
            "walked area"
        );

        areas.push(VmaEntry::new(
            record.start,
            record.end,
            permissions(profile, record.flags),
            backing,
        ));
    }

    (areas, diagnostics)
}
