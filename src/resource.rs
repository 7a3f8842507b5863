//! # Resource Manager
//!
//! Implements the OSEK priority-ceiling protocol over the statically declared
//! resources.
//!
//! Each resource has a *ceiling*: the highest base priority of any task
//! configured to lock it. Locking raises the holder's current priority to at
//! least the ceiling, so no other task that could contend for the resource is
//! ever dispatched while it is held. On a single core this makes a busy
//! resource impossible in a correct configuration, so locking never blocks.
//!
//! Every task keeps its held resources on a LIFO stack. Unlocking must pop
//! the top of that stack; the current priority is then recomputed from the
//! base priority and the ceilings still held.
//!
//! ```text
//!   prio
//!    8 ┤        ┌──────── R (ceiling 8) ────────┐
//!    5 ┤────────┘                               └──────── A
//!      └──────── lock(R) ─────────────────── unlock(R) ──► t
//! ```

use core::fmt;

use heapless::Vec;

use crate::config::{MAX_LOCK_DEPTH, MAX_RESOURCES};
use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::task::{Priority, TaskConfig, TaskControlBlock, TaskId};

/// Dense resource identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub u8);

impl ResourceId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res#{}", self.0)
    }
}

/// A set of resources, used to declare which resources a task may lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceSet(u32);

impl ResourceSet {
    pub const EMPTY: Self = Self(0);

    /// Add `id` to the set. Only ids below 32 fit; in a `const`
    /// configuration a larger one is a compile-time error.
    pub const fn with(self, id: ResourceId) -> Self {
        assert!(id.0 < 32, "resource id does not fit a ResourceSet");
        Self(self.0 | (1 << id.0))
    }

    #[inline]
    pub const fn contains(self, id: ResourceId) -> bool {
        id.0 < 32 && self.0 & (1 << id.0) != 0
    }

    /// Highest resource index named by the set, if any.
    fn highest(self) -> Option<usize> {
        (self.0 != 0).then(|| 31 - self.0.leading_zeros() as usize)
    }
}

/// Static configuration for a resource.
#[derive(Debug, Clone, Copy)]
pub struct ResourceConfig {
    /// Name used in log output.
    pub name: &'static str,
}

/// Resource control block.
#[derive(Debug, Clone)]
pub struct ResourceControlBlock {
    pub id: ResourceId,
    pub config: ResourceConfig,
    /// Fixed at initialization.
    pub ceiling: Priority,
    /// `Some` iff `depth > 0`.
    pub owner: Option<TaskId>,
    pub depth: u8,
}

/// The kernel's resource table.
#[derive(Debug)]
pub struct ResourceManager {
    resources: Vec<ResourceControlBlock, MAX_RESOURCES>,
}

impl ResourceManager {
    /// Build the resource table and compute every ceiling from the tasks'
    /// resource sets.
    ///
    /// Fails with `InvalidId` if there are more than `MAX_RESOURCES`
    /// resources or a task names a resource that doesn't exist.
    pub fn new(configs: &[ResourceConfig], tasks: &[TaskConfig]) -> Result<Self, Error> {
        let mut resources = Vec::new();
        for (i, config) in configs.iter().enumerate() {
            let id = ResourceId(i as u8);
            let ceiling = tasks
                .iter()
                .filter(|t| t.resources.contains(id))
                .map(|t| t.priority)
                .max()
                .unwrap_or(0);
            resources
                .push(ResourceControlBlock {
                    id,
                    config: *config,
                    ceiling,
                    owner: None,
                    depth: 0,
                })
                .map_err(|_| Error::InvalidId)?;
        }

        for task in tasks {
            if let Some(i) = task.resources.highest() {
                if i >= resources.len() {
                    log::error!("task '{}' names undeclared resource #{}", task.name, i);
                    return Err(Error::InvalidId);
                }
            }
        }

        Ok(Self { resources })
    }

    pub fn get(&self, id: ResourceId) -> Result<&ResourceControlBlock, Error> {
        self.resources.get(id.index()).ok_or(Error::InvalidId)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceControlBlock> {
        self.resources.iter()
    }

    /// Lock `res` on behalf of `task` (the running task) and raise its
    /// priority to the ceiling.
    pub fn lock(
        &mut self,
        sched: &mut Scheduler,
        task: TaskId,
        res: ResourceId,
    ) -> Result<(), Error> {
        let rcb = self.resources.get(res.index()).ok_or(Error::InvalidId)?;
        let tcb = sched.task(task)?;

        if !tcb.config.resources.contains(res) {
            return Err(Error::Access);
        }

        let reentrant = match rcb.owner {
            Some(owner) if owner == task => true,
            // Another task holds it: the ceilings are misconfigured.
            Some(_) => return Err(Error::Access),
            None => false,
        };

        #[cfg(feature = "nesting_checks")]
        if !reentrant {
            let out_of_order = tcb
                .held
                .iter()
                .any(|&h| h != res && self.resources[h.index()].ceiling < rcb.ceiling);
            if out_of_order {
                return Err(Error::NestingViolation);
            }
        }

        let ceiling = rcb.ceiling;
        let tcb = sched.task_mut(task)?;
        tcb.held.push(res).map_err(|_| Error::InvalidValue)?;
        tcb.current_priority = tcb.current_priority.max(ceiling);

        let rcb = &mut self.resources[res.index()];
        rcb.owner = Some(task);
        rcb.depth += 1;

        log::debug!(
            "{} locked '{}' (depth {}, prio {})",
            task,
            rcb.config.name,
            rcb.depth,
            tcb.current_priority
        );
        if reentrant {
            log::trace!("re-entrant lock of {}", res);
        }
        Ok(())
    }

    /// Unlock `res` on behalf of `task` and run the dispatch check, since
    /// the priority drop may make a higher-priority ready task eligible.
    pub fn unlock(
        &mut self,
        sched: &mut Scheduler,
        task: TaskId,
        res: ResourceId,
    ) -> Result<(), Error> {
        self.unlock_core(sched, task, res)?;
        sched.dispatch();
        Ok(())
    }

    fn unlock_core(
        &mut self,
        sched: &mut Scheduler,
        task: TaskId,
        res: ResourceId,
    ) -> Result<(), Error> {
        let rcb = self.resources.get(res.index()).ok_or(Error::InvalidId)?;
        if rcb.owner != Some(task) {
            return Err(Error::NotOwner);
        }

        let tcb = sched.task_mut(task)?;
        if tcb.held.last() != Some(&res) {
            return Err(Error::UnlockOrderViolation);
        }
        tcb.held.pop();

        let rcb = &mut self.resources[res.index()];
        rcb.depth -= 1;
        if rcb.depth == 0 {
            rcb.owner = None;
        }

        let prio = self.effective_priority(tcb);
        tcb.current_priority = prio;
        log::debug!(
            "{} released '{}' (prio {})",
            task,
            self.resources[res.index()].config.name,
            tcb.current_priority
        );
        Ok(())
    }

    /// Release everything `task` holds, most recently locked first, and
    /// return the resources in the order they were released. Doesn't
    /// dispatch.
    pub fn release_all(
        &mut self,
        sched: &mut Scheduler,
        task: TaskId,
    ) -> Vec<ResourceId, MAX_LOCK_DEPTH> {
        let mut released = Vec::new();
        while let Some(&top) = sched.task(task).ok().and_then(|t| t.held.last()) {
            if let Err(e) = self.unlock_core(sched, task, top) {
                // The held stack and the owner table disagree.
                log::error!("{} cannot release {}: {}", task, top, e);
                break;
            }
            // Capacity equals the held stack's, so this never fails.
            let _ = released.push(top);
        }
        released
    }

    /// Base priority raised to the ceiling of every resource still held.
    pub fn effective_priority(&self, tcb: &TaskControlBlock) -> Priority {
        tcb.held
            .iter()
            .map(|r| self.resources[r.index()].ceiling)
            .fold(tcb.base_priority(), Priority::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    extern "C" fn entry() {}

    const R0: ResourceId = ResourceId(0);
    const R1: ResourceId = ResourceId(1);

    const RESOURCES: [ResourceConfig; 2] = [
        ResourceConfig { name: "r0" },
        ResourceConfig { name: "r1" },
    ];

    fn setup() -> (Scheduler, ResourceManager) {
        let tasks = [
            TaskConfig::new("low", 2, entry).with_resources(ResourceSet::EMPTY.with(R0).with(R1)),
            TaskConfig::new("mid", 5, entry).with_resources(ResourceSet::EMPTY.with(R0)),
            TaskConfig::new("high", 9, entry),
        ];
        let mut sched = Scheduler::new();
        for t in &tasks {
            sched.add_task(*t).unwrap();
        }
        let resources = ResourceManager::new(&RESOURCES, &tasks).unwrap();
        (sched, resources)
    }

    fn run(sched: &mut Scheduler, task: TaskId) {
        sched.activate(task).unwrap();
        sched.dispatch();
        assert_eq!(sched.running(), Some(task));
    }

    #[test]
    fn test_ceilings_computed_from_task_sets() {
        let (_, resources) = setup();
        assert_eq!(resources.get(R0).unwrap().ceiling, 5);
        assert_eq!(resources.get(R1).unwrap().ceiling, 2);
    }

    #[test]
    fn test_undeclared_resource_rejected() {
        let tasks = [TaskConfig::new("t", 1, entry)
            .with_resources(ResourceSet::EMPTY.with(ResourceId(3)))];
        assert_eq!(
            ResourceManager::new(&RESOURCES, &tasks).err(),
            Some(Error::InvalidId)
        );
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_resource_set_rejects_wide_id() {
        let _ = ResourceSet::EMPTY.with(ResourceId(33));
    }

    #[test]
    fn test_resource_set_membership() {
        let set = ResourceSet::EMPTY.with(R1).with(ResourceId(31));
        assert!(set.contains(R1));
        assert!(set.contains(ResourceId(31)));
        assert!(!set.contains(R0));
        assert!(!set.contains(ResourceId(33)));
    }

    #[test]
    fn test_lock_raises_priority_and_unlock_restores() {
        let (mut sched, mut resources) = setup();
        let low = TaskId(0);
        run(&mut sched, low);

        resources.lock(&mut sched, low, R0).unwrap();
        assert_eq!(sched.task(low).unwrap().current_priority, 5);
        assert_eq!(resources.get(R0).unwrap().owner, Some(low));

        resources.lock(&mut sched, low, R1).unwrap();
        // Never lowered by a lower-ceiling resource
        assert_eq!(sched.task(low).unwrap().current_priority, 5);

        resources.unlock(&mut sched, low, R1).unwrap();
        assert_eq!(sched.task(low).unwrap().current_priority, 5);
        resources.unlock(&mut sched, low, R0).unwrap();
        assert_eq!(sched.task(low).unwrap().current_priority, 2);
        assert_eq!(resources.get(R0).unwrap().owner, None);
        assert_eq!(resources.get(R0).unwrap().depth, 0);
    }

    #[test]
    fn test_unlock_order_violation() {
        let (mut sched, mut resources) = setup();
        let low = TaskId(0);
        run(&mut sched, low);

        resources.lock(&mut sched, low, R0).unwrap();
        resources.lock(&mut sched, low, R1).unwrap();
        assert_eq!(
            resources.unlock(&mut sched, low, R0),
            Err(Error::UnlockOrderViolation)
        );
        // Nothing changed
        assert_eq!(sched.task(low).unwrap().held.len(), 2);
    }

    #[test]
    fn test_not_owner() {
        let (mut sched, mut resources) = setup();
        let low = TaskId(0);
        run(&mut sched, low);
        assert_eq!(resources.unlock(&mut sched, low, R0), Err(Error::NotOwner));
        assert_eq!(
            resources.unlock(&mut sched, low, ResourceId(7)),
            Err(Error::InvalidId)
        );
    }

    #[test]
    fn test_access_checks() {
        let (mut sched, mut resources) = setup();
        let high = TaskId(2);
        run(&mut sched, high);
        assert_eq!(resources.lock(&mut sched, high, R0), Err(Error::Access));
        assert_eq!(
            resources.lock(&mut sched, high, ResourceId(5)),
            Err(Error::InvalidId)
        );
    }

    #[test]
    fn test_busy_resource_is_access_error() {
        let (mut sched, mut resources) = setup();
        let (low, mid) = (TaskId(0), TaskId(1));
        run(&mut sched, low);
        resources.lock(&mut sched, low, R1).unwrap();

        // mid (5) preempts low, which is only boosted to 2
        run(&mut sched, mid);
        resources.lock(&mut sched, mid, R0).unwrap();
        resources.unlock(&mut sched, mid, R0).unwrap();

        // Forge a conflicting owner to exercise the check.
        resources.resources[R0.index()].owner = Some(low);
        resources.resources[R0.index()].depth = 1;
        assert_eq!(resources.lock(&mut sched, mid, R0), Err(Error::Access));
    }

    #[test]
    fn test_reentrant_lock_nests() {
        let (mut sched, mut resources) = setup();
        let low = TaskId(0);
        run(&mut sched, low);

        resources.lock(&mut sched, low, R0).unwrap();
        resources.lock(&mut sched, low, R0).unwrap();
        assert_eq!(resources.get(R0).unwrap().depth, 2);

        resources.unlock(&mut sched, low, R0).unwrap();
        assert_eq!(resources.get(R0).unwrap().owner, Some(low));
        resources.unlock(&mut sched, low, R0).unwrap();
        assert_eq!(resources.get(R0).unwrap().owner, None);
    }

    #[test]
    fn test_release_all_reverse_order() {
        let (mut sched, mut resources) = setup();
        let low = TaskId(0);
        run(&mut sched, low);

        resources.lock(&mut sched, low, R0).unwrap();
        resources.lock(&mut sched, low, R1).unwrap();
        let released = resources.release_all(&mut sched, low);
        assert_eq!(released.as_slice(), &[R1, R0]);
        assert!(resources.iter().all(|r| r.owner.is_none() && r.depth == 0));
        assert_eq!(sched.task(low).unwrap().current_priority, 2);
        assert_eq!(sched.task(low).unwrap().state, TaskState::Running);
    }

    #[test]
    fn test_unlock_dispatches_higher_ready_task() {
        let (mut sched, mut resources) = setup();
        let (low, mid) = (TaskId(0), TaskId(1));
        run(&mut sched, low);
        resources.lock(&mut sched, low, R0).unwrap();

        sched.activate(mid).unwrap();
        sched.dispatch();
        // mid (5) does not exceed the ceiling (5)
        assert_eq!(sched.running(), Some(low));

        resources.unlock(&mut sched, low, R0).unwrap();
        assert_eq!(sched.running(), Some(mid));
        assert_eq!(sched.task(low).unwrap().state, TaskState::Ready);
    }

    #[cfg(feature = "nesting_checks")]
    #[test]
    fn test_nesting_violation() {
        let (mut sched, mut resources) = setup();
        let low = TaskId(0);
        run(&mut sched, low);

        // R1 (ceiling 2) held, R0 (ceiling 5) requested
        resources.lock(&mut sched, low, R1).unwrap();
        assert_eq!(
            resources.lock(&mut sched, low, R0),
            Err(Error::NestingViolation)
        );
    }
}
