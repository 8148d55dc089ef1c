//! Process lookup
//!
//! Finds the target process by walking the kernel's circular task list out of
//! the image. The walk is a plain loop over physical handles: each `tasks.next`
//! pointer is converted through the direct map, and handles already seen end
//! the walk, so a corrupted list cannot spin forever.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::image::PhysicalMemory;
use crate::profile::KernelProfile;
use crate::translate::AddressSpace;
use crate::{Error, Result};

/// Length of `task_struct.comm`
const TASK_COMM_LEN: usize = 16;

/// Which process to recover from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessSelector {
    Pid(i32),
    /// Matches `comm` exactly
    Name(String),
}

impl fmt::Display for ProcessSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessSelector::Pid(pid) => write!(f, "pid {}", pid),
            ProcessSelector::Name(name) => write!(f, "name '{}'", name),
        }
    }
}

/// A task found on the task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub pid: i32,
    pub comm: String,
    /// Physical offset of the `task_struct`
    pub task: u64,
    /// Physical offset of the `mm_struct` (None for kernel threads)
    pub mm: Option<u64>,
}

/// Result of walking the task list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskWalk {
    pub tasks: Vec<TaskInfo>,
    pub diagnostics: Vec<String>,
}

/// The process whose memory is being recovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessContext {
    pub pid: i32,
    pub comm: String,
    /// Physical offset of the `task_struct` (None when built from a maps file)
    pub task: Option<u64>,
    /// Physical offset of the `mm_struct`
    pub mm: Option<u64>,
    pub space: AddressSpace,
}

impl ProcessContext {
    /// Build a context without a kernel walk (maps file + region table captures)
    pub fn from_parts(pid: i32, comm: impl Into<String>, space: AddressSpace) -> Self {
        Self {
            pid,
            comm: comm.into(),
            task: None,
            mm: None,
            space,
        }
    }

    /// Locate a process in the image
    pub fn locate(
        memory: &dyn PhysicalMemory,
        profile: &KernelProfile,
        selector: &ProcessSelector,
    ) -> Result<Self> {
        profile.validate()?;
        let walk = walk_tasks(memory, profile)?;

        let mut candidates: Vec<&TaskInfo> = walk
            .tasks
            .iter()
            .filter(|t| match selector {
                ProcessSelector::Pid(pid) => t.pid == *pid,
                ProcessSelector::Name(name) => &t.comm == name,
            })
            .collect();
        candidates.sort_by_key(|t| t.pid);

        if candidates.len() > 1 {
            tracing::warn!(
                %selector,
                matches = candidates.len(),
                "several tasks match, using the lowest pid"
            );
        }

        let task = candidates.first().ok_or_else(|| {
            Error::ProcessNotFound(format!(
                "no task with {} among {} walked",
                selector,
                walk.tasks.len()
            ))
        })?;

        let mm = task.mm.ok_or_else(|| {
            Error::ProcessNotFound(format!(
                "pid {} ({}) has no user address space",
                task.pid, task.comm
            ))
        })?;

        let root = match profile.dtb {
            Some(dtb) => dtb,
            None => {
                let pgd = read_field(memory, mm, profile.mm.pgd).map_err(|e| match e {
                    Error::AbsentPage { .. } => Error::ProcessNotFound(format!(
                        "pid {} ({}): page-table root unreadable: {}",
                        task.pid, task.comm, e
                    )),
                    e => e,
                })?;
                profile.kva_to_phys(pgd).ok_or_else(|| {
                    Error::ProcessNotFound(format!(
                        "pid {} has a pgd ({:#x}) outside the direct map",
                        task.pid, pgd
                    ))
                })?
            }
        };

        tracing::info!(
            pid = task.pid,
            comm = %task.comm,
            task = format_args!("{:#x}", task.task),
            pgd = format_args!("{:#x}", root),
            "located process"
        );

        Ok(Self {
            pid: task.pid,
            comm: task.comm.clone(),
            task: Some(task.task),
            mm: Some(mm),
            space: AddressSpace::PageTable { root },
        })
    }
}

fn read_field(memory: &dyn PhysicalMemory, base: u64, offset: u64) -> Result<u64> {
    memory.read_u64(base.saturating_add(offset))
}

fn read_task(
    memory: &dyn PhysicalMemory,
    profile: &KernelProfile,
    task: u64,
) -> Result<TaskInfo> {
    let offsets = &profile.task;
    let pid = memory.read_i32(task.saturating_add(offsets.pid))?;
    let comm = memory.read_cstring(task.saturating_add(offsets.comm), TASK_COMM_LEN)?;
    let mm_ptr = memory.read_u64(task.saturating_add(offsets.mm))?;

    let mm = if mm_ptr == 0 {
        None
    } else {
        profile.kva_to_phys(mm_ptr)
    };

    Ok(TaskInfo {
        pid,
        comm,
        task,
        mm,
    })
}

/// Follow one `list_head` pointer (`next` at +0, `prev` at +8) to the
/// containing task's handle
fn neighbour(
    memory: &dyn PhysicalMemory,
    profile: &KernelProfile,
    task: u64,
    backwards: bool,
) -> Result<Option<u64>> {
    let link = task
        .saturating_add(profile.task.tasks)
        .saturating_add(if backwards { 8 } else { 0 });
    let ptr = memory.read_u64(link)?;
    Ok(profile
        .kva_to_phys(ptr)
        .and_then(|phys| phys.checked_sub(profile.task.tasks)))
}

/// Walk the task list starting at `init_task`.
///
/// The forward (`next`) direction is walked first; if it breaks on an
/// unreadable task, the backward (`prev`) direction picks up the rest.
pub fn walk_tasks(memory: &dyn PhysicalMemory, profile: &KernelProfile) -> Result<TaskWalk> {
    let anchor = profile.init_task;
    let first = read_task(memory, profile, anchor).map_err(|e| {
        Error::ProcessNotFound(format!(
            "task list anchor at {:#x} is unreadable: {}",
            anchor, e
        ))
    })?;

    let mut walk = TaskWalk::default();
    let mut visited: HashSet<u64> = HashSet::new();
    visited.insert(anchor);
    walk.tasks.push(first);

    for backwards in [false, true] {
        let direction = if backwards { "prev" } else { "next" };
        let mut current = anchor;

        loop {
            if walk.tasks.len() >= profile.limits.max_tasks {
                walk.diagnostics
                    .push(format!("task walk stopped at {} tasks", walk.tasks.len()));
                return Ok(walk);
            }

            let next = match neighbour(memory, profile, current, backwards) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    walk.diagnostics.push(format!(
                        "task {:#x}: {} pointer outside the direct map",
                        current, direction
                    ));
                    break;
                }
                Err(e) => {
                    walk.diagnostics
                        .push(format!("task {:#x}: {} unreadable: {}", current, direction, e));
                    break;
                }
            };

            if !visited.insert(next) {
                // Forward: only the anchor may close the circle. Backward:
                // meeting the forward pass is the normal end.
                if next != anchor && !backwards {
                    walk.diagnostics.push(format!(
                        "task {:#x}: {} revisits task {:#x}",
                        current, direction, next
                    ));
                }
                break;
            }

            match read_task(memory, profile, next) {
                Ok(task) => {
                    tracing::debug!(pid = task.pid, comm = %task.comm, "walked task");
                    walk.tasks.push(task);
                    current = next;
                }
                Err(e) => {
                    tracing::warn!(task = format_args!("{:#x}", next), error = %e, "unreadable task");
                    walk.diagnostics
                        .push(format!("task {:#x} unreadable: {}", next, e));
                    break;
                }
            }
        }

        // A complete circle needs no second pass
        if walk.diagnostics.is_empty() {
            break;
        }
    }

    Ok(walk)
}
