use crate::tools::error::{DtnError, Result};
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Per-process task id, 1..N.
pub type TaskId = u32;

thread_local! {
    static CURRENT_TASK: Cell<TaskId> = const { Cell::new(0) };
}

// Task ids are per-process, not per-registry, so ids stay unambiguous
// when several registries coexist in one process.
static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(0);

/// Arguments handed to a spawned task's entry function.
pub struct TaskArgs {
    /// Registry id of this task
    pub task_id: TaskId,
    /// Owned argument strings. Host argv is passed by value, so the
    /// argument-buffer bank of shared-memory ports collapses to a no-op.
    pub args: Vec<String>,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for TaskArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskArgs(#{}, {:?})", self.task_id, self.args)
    }
}

impl TaskArgs {
    /// True once the task has been asked to stop.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

type TaskEntry = Arc<dyn Fn(TaskArgs) + Send + Sync>;

struct TaskDef {
    entry: TaskEntry,
    priority: u8,
    stack_size: usize,
}

struct TaskSlot {
    name: String,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Registry of live tasks plus the symbol table of launchable task names.
#[derive(Default)]
pub struct TaskRegistry {
    symbols: Mutex<HashMap<String, TaskDef>>,
    tasks: Mutex<HashMap<TaskId, TaskSlot>>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskRegistry({} tasks)", self.tasks.lock().len())
    }
}

impl TaskRegistry {
    fn new_id(&self) -> TaskId {
        NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a launchable task under `name` with scheduling hints.
    pub fn define<F>(&self, name: &str, priority: u8, stack_size: usize, entry: F)
    where
        F: Fn(TaskArgs) + Send + Sync + 'static,
    {
        self.symbols.lock().insert(
            name.to_owned(),
            TaskDef {
                entry: Arc::new(entry),
                priority,
                stack_size,
            },
        );
    }

    /// Launch the task registered under `name` on a new thread.
    pub fn spawn(&self, name: &str, args: Vec<String>) -> Result<TaskId> {
        let def = {
            let symbols = self.symbols.lock();
            let def = symbols
                .get(name)
                .ok_or_else(|| DtnError::new(format!("No task named {}", name)))?;
            (def.entry.clone(), def.priority, def.stack_size)
        };

        let (entry, priority, stack_size) = def;
        let task_id = self.new_id();
        let stop = Arc::new(AtomicBool::new(false));
        let task_args = TaskArgs {
            task_id,
            args,
            stop: stop.clone(),
        };

        log::debug!("Spawning task {} #{} (priority {})", name, task_id, priority);
        let mut builder = std::thread::Builder::new().name(format!("{}-{}", name, task_id));
        if stack_size > 0 {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(move || {
            CURRENT_TASK.with(|c| c.set(task_id));
            entry(task_args);
        })?;

        self.tasks.lock().insert(
            task_id,
            TaskSlot {
                name: name.to_owned(),
                stop,
                handle: Some(handle),
            },
        );
        Ok(task_id)
    }

    /// Launch an anonymous one-shot task (no symbol-table entry).
    pub fn spawn_fn<F>(&self, label: &str, f: F) -> Result<TaskId>
    where
        F: FnOnce(TaskArgs) + Send + 'static,
    {
        let task_id = self.new_id();
        let stop = Arc::new(AtomicBool::new(false));
        let task_args = TaskArgs {
            task_id,
            args: Vec::new(),
            stop: stop.clone(),
        };

        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", label, task_id))
            .spawn(move || {
                CURRENT_TASK.with(|c| c.set(task_id));
                f(task_args);
            })?;

        self.tasks.lock().insert(
            task_id,
            TaskSlot {
                name: label.to_owned(),
                stop,
                handle: Some(handle),
            },
        );
        Ok(task_id)
    }

    /// Register the calling thread itself as a task; returns its id. A
    /// thread already attached keeps its process-wide id, but becomes
    /// known to this registry too.
    pub fn attach_self(&self, name: &str) -> TaskId {
        let task_id = match CURRENT_TASK.with(|c| c.get()) {
            0 => {
                let task_id = self.new_id();
                CURRENT_TASK.with(|c| c.set(task_id));
                task_id
            }
            existing => existing,
        };

        self.tasks.lock().entry(task_id).or_insert_with(|| TaskSlot {
            name: name.to_owned(),
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        });
        task_id
    }

    /// Task id of the calling thread, or 0 if it was never registered.
    pub fn self_id(&self) -> TaskId {
        CURRENT_TASK.with(|c| c.get())
    }

    /// True if the task is registered and its thread has not finished.
    pub fn exists(&self, task_id: TaskId) -> bool {
        let tasks = self.tasks.lock();
        match tasks.get(&task_id) {
            Some(slot) => match &slot.handle {
                Some(handle) => !handle.is_finished(),
                None => true,
            },
            None => false,
        }
    }

    /// Ask the task to stop. The signal number is recorded for parity with
    /// process-based ports; any signal raises the stop flag.
    pub fn kill(&self, task_id: TaskId, sig: i32) {
        if let Some(slot) = self.tasks.lock().get(&task_id) {
            log::debug!("Killing task {} #{} (sig {})", slot.name, task_id, sig);
            slot.stop.store(true, Ordering::Relaxed);
        }
    }

    /// Remove the task from the registry, joining its thread if finished.
    pub fn delete(&self, task_id: TaskId) {
        if let Some(slot) = self.tasks.lock().remove(&task_id) {
            if let Some(handle) = slot.handle {
                if handle.is_finished() {
                    handle.join().ok();
                }
            }
        }
    }

    /// Wait for the task's thread to finish and remove it.
    pub fn join(&self, task_id: TaskId) {
        let handle = self
            .tasks
            .lock()
            .get_mut(&task_id)
            .and_then(|slot| slot.handle.take());
        if let Some(handle) = handle {
            handle.join().ok();
        }
        self.tasks.lock().remove(&task_id);
    }

    /// Yield the processor.
    pub fn yield_cpu(&self) {
        std::thread::yield_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[test]
    fn test_spawn_named_task() {
        let registry = TaskRegistry::default();
        let counter = Arc::new(AtomicU64::new(0));
        let c = counter.clone();
        registry.define("bump", 1, 64 * 1024, move |args: TaskArgs| {
            let n: u64 = args.args[0].parse().unwrap();
            c.fetch_add(n, Ordering::Relaxed);
        });

        let id = registry.spawn("bump", vec!["41".to_owned()]).unwrap();
        registry.join(id);
        assert_eq!(counter.load(Ordering::Relaxed), 41);
        assert!(!registry.exists(id));
    }

    #[test]
    fn test_kill_raises_stop_flag() {
        let registry = TaskRegistry::default();
        let id = registry
            .spawn_fn("spinner", |args| {
                while !args.stop_requested() {
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();
        assert!(registry.exists(id));
        registry.kill(id, 15);
        registry.join(id);
        assert!(!registry.exists(id));
    }

    #[test]
    fn test_attach_self() {
        let registry = TaskRegistry::default();
        let id = registry.attach_self("main");
        assert_eq!(registry.self_id(), id);
        assert_eq!(registry.attach_self("main"), id);
        assert!(registry.exists(id));
    }

    #[test]
    fn test_unknown_symbol() {
        let registry = TaskRegistry::default();
        assert!(registry.spawn("nope", Vec::new()).is_err());
    }
}
