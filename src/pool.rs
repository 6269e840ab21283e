use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{ExpensortError, Result};

/// A fixed number of tokens shared by every clone. Holding a [`Permit`]
/// counts as one unit of work in flight; dropping it hands the token back.
#[derive(Clone)]
pub struct Permits {
    give: Sender<()>,
    take: Receiver<()>,
}

impl Permits {
    pub fn new(count: usize) -> Self {
        let (give, take) = bounded(count.max(1));
        for _ in 0..count {
            // Capacity covers every token.
            let _ = give.try_send(());
        }
        Self { give, take }
    }

    /// Block until a token is free.
    pub fn acquire(&self) -> Result<Permit<'_>> {
        self.take
            .recv()
            .map_err(|_| ExpensortError::Internal("permit channel closed".to_string()))?;
        Ok(Permit { owner: self })
    }
}

pub struct Permit<'a> {
    owner: &'a Permits,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let _ = self.owner.give.try_send(());
    }
}

/// Run `work` over `items` on at most `concurrency` threads and return the
/// outputs in input order.
///
/// Jobs go through a bounded queue so nothing is submitted far ahead of the
/// workers. The first error raises a shared stop flag: the feeder stops
/// submitting, workers skip whatever is still queued, and outputs that finish
/// afterwards are dropped. That first error is returned.
pub fn run_bounded<T, R, F>(items: Vec<T>, concurrency: usize, work: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
{
    if concurrency == 0 {
        return Err(ExpensortError::InvalidArgument(
            "concurrency must be a positive integer".to_string(),
        ));
    }
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }
    let workers = concurrency.min(total);
    let stop = AtomicBool::new(false);

    thread::scope(|scope| -> Result<Vec<R>> {
        let (job_tx, job_rx) = bounded::<(usize, T)>(workers);
        let (out_tx, out_rx) = unbounded::<(usize, Result<R>)>();

        for w in 0..workers {
            let job_rx = job_rx.clone();
            let out_tx = out_tx.clone();
            let stop = &stop;
            let work = &work;
            thread::Builder::new()
                .name(format!("expensort-worker-{w}"))
                .spawn_scoped(scope, move || {
                    for (i, item) in job_rx.iter() {
                        if stop.load(Ordering::Acquire) {
                            continue;
                        }
                        let out = work(item);
                        if out.is_err() {
                            stop.store(true, Ordering::Release);
                        }
                        if out_tx.send((i, out)).is_err() {
                            break;
                        }
                    }
                })?;
        }
        drop(job_rx);
        drop(out_tx);

        let mut submitted = 0;
        for (i, item) in items.into_iter().enumerate() {
            if stop.load(Ordering::Acquire) || job_tx.send((i, item)).is_err() {
                break;
            }
            submitted += 1;
        }
        drop(job_tx);
        if submitted < total {
            warn!(submitted, total, "stopped submitting work after a failure");
        }
        debug!(submitted, workers, "all work submitted");

        let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(total).collect();
        let mut first_err: Option<ExpensortError> = None;
        for (i, out) in out_rx.iter() {
            match out {
                Ok(r) if first_err.is_none() => slots[i] = Some(r),
                Ok(_) => {}
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| ExpensortError::Internal(format!("work item {i} produced no output")))
            })
            .collect()
    })
}
