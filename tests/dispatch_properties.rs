// tests/dispatch_properties.rs

use std::time::Duration;

use chunkdag::dispatch::{map_unordered, DispatchOptions};
use chunkdag::remote::{sync_fn, RemoteFn};
use chunkdag_test_utils::{CallPlan, ScriptedExecutor};
use proptest::prelude::*;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("failed to build paused runtime")
}

fn square() -> RemoteFn<u32, u64> {
    sync_fn(|x: u32| Ok(u64::from(x) * u64::from(x)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every item yields exactly one result, whatever the completion order.
    #[test]
    fn results_match_inputs_as_a_multiset(
        items in proptest::collection::vec(0u32..1000, 0..60),
        use_backups in any::<bool>(),
    ) {
        let rt = paused_runtime();
        let mut results: Vec<u64> = rt.block_on(async {
            let mut exec = ScriptedExecutor::new(|item: &u32, _| {
                CallPlan::after(Duration::from_millis(100 * u64::from(item % 7 + 1)))
            });
            let options = DispatchOptions { use_backups, ..DispatchOptions::default() };
            map_unordered(&mut exec, square(), items.clone(), options)
                .collect_all()
                .await
                .unwrap()
                .into_iter()
                .map(|c| c.value)
                .collect()
        });

        let mut expected: Vec<u64> = items.iter().map(|&x| u64::from(x) * u64::from(x)).collect();
        results.sort_unstable();
        expected.sort_unstable();
        prop_assert_eq!(results, expected);
    }

    /// Zero-variance latency never looks like a straggler.
    #[test]
    fn uniform_latency_never_backs_up(
        n in 0usize..80,
        latency_ms in 1u64..5000,
    ) {
        let rt = paused_runtime();
        let (backups, submitted) = rt.block_on(async {
            let mut exec = ScriptedExecutor::<u32, u64>::uniform(Duration::from_millis(latency_ms));
            let options = DispatchOptions { use_backups: true, ..DispatchOptions::default() };
            let items: Vec<u32> = (0..n as u32).collect();

            let mut stream = map_unordered(&mut exec, square(), items, options);
            while let Some(next) = stream.next().await {
                next.unwrap();
            }
            let backups = stream.counters().backups_launched;
            drop(stream);
            (backups, exec.submitted())
        });

        prop_assert_eq!(backups, 0);
        prop_assert_eq!(submitted, n);
    }

    /// `failing` distinct items fail once each; with a ceiling at least that
    /// high the dispatch still succeeds.
    #[test]
    fn failures_within_the_ceiling_are_absorbed(
        n in 1usize..40,
        failing in 0usize..10,
        slack in 0usize..3,
    ) {
        let failing = failing.min(n);
        let rt = paused_runtime();
        let (count, failures) = rt.block_on(async {
            let mut exec = ScriptedExecutor::new(move |item: &u32, attempt| {
                let plan = CallPlan::after(Duration::from_secs(1));
                if (*item as usize) < failing && attempt == 0 {
                    plan.failing("Transient", "lost worker")
                } else {
                    plan
                }
            });
            let options = DispatchOptions {
                max_failures: failing + slack,
                ..DispatchOptions::default()
            };
            let items: Vec<u32> = (0..n as u32).collect();

            let mut stream = map_unordered(&mut exec, square(), items, options);
            let mut count = 0;
            while let Some(next) = stream.next().await {
                next.unwrap();
                count += 1;
            }
            (count, stream.counters().failures)
        });

        prop_assert_eq!(count, n);
        prop_assert_eq!(failures, failing);
    }
}
