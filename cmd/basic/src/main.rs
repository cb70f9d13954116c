//! Basic strand example
//!
//! Walks through scopes, supervision, timeouts, the mutex and the three
//! stream kinds on one runtime.
//!
//! # Environment Variables
//!
//! - `STRAND_FLUSH_EPRINT=1` - Flush debug output immediately (useful for crash debugging)
//! - `STRAND_LOG_LEVEL=debug` - Set log level (off, error, warn, info, debug, trace)

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use strand::{
    delay, sequence, with_timeout_or_none, Broadcast, BroadcastConfig, Mutex, Runtime,
    RuntimeConfig, StateCell, TaskError, TaskResult,
};
use strand::{kdebug, kinfo};

// STRAND_LOG_LEVEL=debug STRAND_FLUSH_EPRINT=1 cargo run -p strand-basic
fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== strand Basic Example ===\n");

    let config = RuntimeConfig::from_env()
        .core_workers(2)
        .cpu_parallelism(2)
        .io_parallelism(4);
    let runtime = Runtime::builder().config(config).build()?;

    // Structured fan-out: the block returns once every child is done
    let sum = runtime.block_on(|scope| async move {
        let parts: Vec<_> = (1..=4u64)
            .map(|i| {
                scope.spawn(move |_| async move {
                    kdebug!("[part {}] started", i);
                    delay(Duration::from_millis(10 * i)).await?;
                    Ok(i * i)
                })
            })
            .collect::<TaskResult<_>>()?;
        let mut sum = 0;
        for part in parts {
            sum += part.await?;
        }
        Ok(sum)
    })?;
    println!("sum of squares: {}", sum);

    // Supervision: one failing child leaves its sibling alone
    let survived = runtime.block_on(|scope| async move {
        let sup = scope.supervisor()?;
        sup.launch(|_| async { Err(TaskError::msg("child gave up")) })?;
        let steady = sup.spawn(|_| async {
            delay(Duration::from_millis(20)).await?;
            Ok("steady finished")
        })?;
        let msg = steady.await?;
        sup.complete();
        Ok(msg)
    })?;
    println!("supervised sibling: {}", survived);

    // Timeout: the slow block is cancelled and cleans up
    let late = runtime.block_on(|_| async {
        with_timeout_or_none(Duration::from_millis(20), async {
            delay(Duration::from_millis(200)).await?;
            Ok("too slow")
        })
        .await
    })?;
    println!("timed out block returned: {:?}", late);

    // Mutex held across a suspension point
    let counter = Arc::new(Mutex::new(0u32));
    let c = Arc::clone(&counter);
    runtime.block_on(move |scope| async move {
        for _ in 0..8 {
            let c = Arc::clone(&c);
            scope.launch(move |_| async move {
                let mut n = c.lock().await?;
                delay(Duration::from_millis(1)).await?;
                *n += 1;
                Ok(())
            })?;
        }
        Ok(())
    })?;
    println!("mutex counter: {}", *counter.try_lock()?);

    // Streams
    let squares = sequence(|out| async move {
        for i in 1..=5u32 {
            out.emit(i * i).await?;
        }
        Ok(())
    });
    let evens = runtime.block_on(move |_| async move {
        squares.filter(|v| v % 2 == 0).to_vec().await
    })?;
    println!("even squares: {:?}", evens);

    let status = StateCell::new("idle");
    let _watch = status.watch(|s| kinfo!("status -> {}", s));
    status.set("loading");
    status.set("loading");
    status.set("ready");
    println!("status: {} ({} watcher)", status.value(), status.subscriber_count());

    let bus: Broadcast<String> = Broadcast::new(BroadcastConfig::default().replay(2))?;
    for word in ["alpha", "beta", "gamma"] {
        bus.try_emit(word.to_string())
            .map_err(|_| "broadcast buffer full")?;
    }
    let replayed = runtime.block_on(move |_| async move {
        let mut sub = bus.subscribe();
        let mut seen = Vec::new();
        while seen.len() < 2 {
            match sub.next().await {
                Some(item) => seen.push(item?),
                None => break,
            }
        }
        Ok(seen)
    })?;
    println!("late subscriber replayed: {:?}", replayed);

    runtime.shutdown();
    println!("\n=== Example Complete ===");
    Ok(())
}
