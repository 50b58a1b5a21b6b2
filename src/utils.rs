use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use hytra::TrAdder;
use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};

/// Runs `f` while exposing an iteration counter; if the computation outlives
/// the configured minimum time, a progress bar is shown until it finishes.
pub(crate) fn with_progress<F, T>(f: F, n_iter: u64, pb_msg: &'static str, config: &crate::Config) -> T
where
    F: FnOnce(&TrAdder<u64>) -> T + Send,
    T: Send,
{
    let it_cnt: TrAdder<u64> = TrAdder::new();
    let finished = AtomicBool::new(false);
    thread::scope(|s| {
        let finished_ref = &finished;
        let it_cnt_ref = &it_cnt;
        let pb_thread_handle = config.progress_min_time().map(|min_time| {
            s.spawn(move || {
                // Wait for at least min_time (unless finished is set in the
                // meantime) before creating the progress bar.
                let start_init_wait = Instant::now();
                loop {
                    let elapsed = start_init_wait.elapsed();
                    if elapsed >= min_time {
                        break;
                    }
                    thread::park_timeout(min_time - elapsed);
                    if finished_ref.load(Ordering::Acquire) {
                        return;
                    }
                }
                let pb = ProgressBar::new(n_iter)
                    .with_style(
                        ProgressStyle::default_spinner()
                            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] (ETA {eta})")
                            .unwrap(),
                    )
                    .with_finish(ProgressFinish::AndClear)
                    .with_message(pb_msg)
                    .with_position(it_cnt_ref.get());
                while !finished_ref.load(Ordering::Acquire) {
                    pb.set_position(it_cnt_ref.get());
                    thread::park_timeout(Duration::from_millis(50));
                }
                pb.finish_using_style();
            })
        });
        let res = f(it_cnt_ref);
        finished.store(true, Ordering::Release);
        if let Some(handle) = pb_thread_handle {
            handle.thread().unpark();
            handle.join().expect("progress thread does not panic");
        }
        res
    })
}
