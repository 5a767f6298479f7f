//! Batch helpers shared by the reference and device importers.
//!
//! `chunk` splits an owned sequence into fixed-size groups. `run_in_waves`
//! drives those groups through an async processor `concurrency` at a time,
//! joining every wave before the next one starts.

use anyhow::Result;
use futures::future::try_join_all;
use std::future::Future;
use tracing::info;

/// Split `items` into consecutive groups of at most `size`, preserving order.
///
/// A `size` of zero is treated as one so the function stays total.
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut out = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

/// Run `process` over `batches` in waves of up to `concurrency` invocations.
///
/// Every invocation in a wave completes before the next wave is created. The
/// first error aborts the run; no later wave is started. Results come back in
/// batch order.
pub async fn run_in_waves<B, R, F, Fut>(
    label: &str,
    batches: Vec<B>,
    concurrency: usize,
    mut process: F,
) -> Result<Vec<R>>
where
    F: FnMut(B) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let concurrency = concurrency.max(1);
    let total = batches.len();
    let mut results = Vec::with_capacity(total);
    let mut iter = batches.into_iter();
    let mut wave_no = 0usize;
    loop {
        let wave: Vec<Fut> = iter.by_ref().take(concurrency).map(&mut process).collect();
        if wave.is_empty() {
            break;
        }
        wave_no += 1;
        let out = try_join_all(wave).await?;
        results.extend(out);
        let pct = format!("{:.1}%", results.len() as f64 / total as f64 * 100.0);
        info!(
            task = label,
            wave = wave_no,
            completed = results.len(),
            total,
            progress = %pct,
            "wave complete"
        );
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn chunk_preserves_order_and_sizes() {
        let items: Vec<u32> = (0..10).collect();
        let groups = chunk(items.clone(), 3);
        assert_eq!(groups.len(), 4);
        assert!(groups[..3].iter().all(|g| g.len() == 3));
        assert_eq!(groups[3], vec![9]);
        let flat: Vec<u32> = groups.into_iter().flatten().collect();
        assert_eq!(flat, items);
    }

    #[test]
    fn chunk_exact_multiple_has_no_short_tail() {
        let groups = chunk((0..6).collect::<Vec<_>>(), 2);
        assert_eq!(groups, vec![vec![0, 1], vec![2, 3], vec![4, 5]]);
    }

    #[test]
    fn chunk_empty_is_empty() {
        let groups: Vec<Vec<u8>> = chunk(Vec::new(), 5);
        assert!(groups.is_empty());
    }

    #[test]
    fn chunk_zero_size_is_treated_as_one() {
        assert_eq!(chunk(vec!['a', 'b'], 0), vec![vec!['a'], vec!['b']]);
    }

    #[tokio::test]
    async fn waves_run_in_groups_of_concurrency() {
        let started = AtomicUsize::new(0);
        let finished = AtomicUsize::new(0);
        // (batch, finished-count observed at start)
        let log = Mutex::new(Vec::new());

        let batches: Vec<usize> = (0..7).collect();
        let out = run_in_waves("test", batches, 3, |b| {
            let started = &started;
            let finished = &finished;
            let log = &log;
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                log.lock().unwrap().push((b, finished.load(Ordering::SeqCst)));
                tokio::time::sleep(std::time::Duration::from_millis(5 * (3 - b as u64 % 3))).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(b * 10)
            }
        })
        .await
        .unwrap();

        assert_eq!(out, vec![0, 10, 20, 30, 40, 50, 60]);
        let log = log.into_inner().unwrap();
        for (batch, finished_at_start) in log {
            // wave sizes are [3, 3, 1]
            let wave = batch / 3;
            assert_eq!(finished_at_start, wave * 3, "batch {batch} overlapped a previous wave");
        }
        assert_eq!(started.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn failing_wave_stops_later_waves() {
        let started = Mutex::new(Vec::new());
        let batches: Vec<usize> = (0..7).collect();
        let res = run_in_waves("test", batches, 3, |b| {
            let started = &started;
            async move {
                started.lock().unwrap().push(b);
                if b == 4 {
                    anyhow::bail!("batch {b} rejected");
                }
                Ok(())
            }
        })
        .await;

        let err = res.unwrap_err();
        assert!(err.to_string().contains("batch 4 rejected"));
        let mut started = started.into_inner().unwrap();
        started.sort_unstable();
        // first two waves may start; the third (batch 6) must not
        assert!(started.iter().all(|b| *b < 6));
        assert!(started.contains(&4));
    }

    #[tokio::test]
    async fn empty_input_yields_no_results() {
        let out: Vec<()> = run_in_waves("test", Vec::<u8>::new(), 3, |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(out.is_empty());
    }
}
