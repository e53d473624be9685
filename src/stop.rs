// EMS CPU STOPPERS
// ONE ACTOR THREAD PER CPU ("migration/N"). A STOP WORK RUNS ON THE ACTOR
// SERIALIZED AGAINST EVERY OTHER STOP WORK FOR THAT CPU AND REPLIES WITH
// WHETHER IT TOOK EFFECT. THE CALLER MUST NOT HOLD RUNQUEUE LOCKS WHILE
// WAITING FOR THE REPLY.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, warn};

pub type StopFn = Box<dyn FnOnce() -> bool + Send + 'static>;

struct StopWork {
    f: StopFn,
    done: Option<Sender<bool>>,
}

struct Stopper {
    tx: Option<Sender<StopWork>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub struct StopStats {
    pub executed: AtomicU64,
    pub aborted: AtomicU64,
}

pub struct CpuStoppers {
    stoppers: Vec<Stopper>,
    stats: Arc<StopStats>,
}

impl CpuStoppers {
    pub fn new(nr_cpus: usize) -> Result<Self> {
        let stats = Arc::new(StopStats::default());
        let mut stoppers = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let (tx, rx) = channel::unbounded::<StopWork>();
            let st = stats.clone();
            let handle = std::thread::Builder::new()
                .name(format!("migration/{}", cpu))
                .spawn(move || {
                    for work in rx {
                        let ok = (work.f)();
                        if ok {
                            st.executed.fetch_add(1, Ordering::Relaxed);
                        } else {
                            st.aborted.fetch_add(1, Ordering::Relaxed);
                        }
                        if let Some(done) = work.done {
                            let _ = done.send(ok);
                        }
                    }
                })
                .with_context(|| format!("failed to create stopper for cpu{}", cpu))?;
            stoppers.push(Stopper { tx: Some(tx), handle: Some(handle) });
        }
        Ok(Self { stoppers, stats })
    }

    fn sender(&self, cpu: usize) -> Result<&Sender<StopWork>> {
        self.stoppers.get(cpu)
            .and_then(|s| s.tx.as_ref())
            .ok_or_else(|| anyhow!("no stopper for cpu{}", cpu))
    }

    // QUEUE AND RETURN THE REPLY CHANNEL
    pub fn stop_one_cpu_nowait(&self, cpu: usize, f: StopFn) -> Result<Receiver<bool>> {
        let (done_tx, done_rx) = channel::bounded(1);
        self.sender(cpu)?
            .send(StopWork { f, done: Some(done_tx) })
            .map_err(|_| anyhow!("stopper for cpu{} is gone", cpu))?;
        Ok(done_rx)
    }

    // RUN `f` ON `cpu`'S STOPPER AND WAIT FOR IT
    pub fn stop_one_cpu(&self, cpu: usize, f: StopFn) -> Result<bool> {
        let rx = self.stop_one_cpu_nowait(cpu, f)?;
        rx.recv().map_err(|_| anyhow!("stopper for cpu{} dropped the work", cpu))
    }

    pub fn executed(&self) -> u64 {
        self.stats.executed.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.stats.aborted.load(Ordering::Relaxed)
    }
}

impl Drop for CpuStoppers {
    fn drop(&mut self) {
        for s in self.stoppers.iter_mut() {
            s.tx.take();
        }
        for (cpu, s) in self.stoppers.iter_mut().enumerate() {
            if let Some(h) = s.handle.take() {
                if h.join().is_err() {
                    warn!("stopper cpu{} panicked", cpu);
                }
            }
        }
        debug!("stoppers: {} executed, {} aborted", self.executed(), self.aborted());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn work_runs_on_the_cpu_thread() {
        let s = CpuStoppers::new(2).unwrap();
        let seen = Arc::new(Mutex::new(String::new()));
        let v = seen.clone();
        let ok = s.stop_one_cpu(1, Box::new(move || {
            *v.lock().unwrap() = std::thread::current().name().unwrap_or("").to_string();
            true
        })).unwrap();
        assert!(ok);
        assert_eq!(*seen.lock().unwrap(), "migration/1");
        assert_eq!(s.executed(), 1);
    }

    #[test]
    fn abort_is_reported() {
        let s = CpuStoppers::new(1).unwrap();
        assert!(!s.stop_one_cpu(0, Box::new(|| false)).unwrap());
        assert_eq!(s.aborted(), 1);
        assert!(s.stop_one_cpu(3, Box::new(|| true)).is_err());
    }

    #[test]
    fn works_on_one_cpu_are_serialized() {
        let s = CpuStoppers::new(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut replies = Vec::new();
        for i in 0..4 {
            let o = order.clone();
            replies.push(s.stop_one_cpu_nowait(0, Box::new(move || {
                o.lock().unwrap().push(i);
                true
            })).unwrap());
        }
        for r in replies {
            assert!(r.recv().unwrap());
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
