//! Shared plumbing for the pipeline stage loops
//!
//! Every stage answers supervisor probes and stops on the kill signal. These
//! helpers keep both reachable while a stage waits on downstream capacity or
//! on work running in its own task.

use crate::infra::supervisor::Liveness;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

/// Resolves once the kill signal is raised or its sender is gone
pub async fn killed(kill: &mut watch::Receiver<bool>) {
    let _ = kill.wait_for(|stop| *stop).await;
}

/// Await a spawned job while answering probes
///
/// The kill signal is not observed here: work in flight runs to completion.
pub async fn await_answering<T>(
    mut handle: JoinHandle<T>,
    liveness: &mut Liveness,
) -> Result<T, JoinError> {
    loop {
        tokio::select! {
            result = &mut handle => return result,
            _ = liveness.probed() => liveness.reply(),
        }
    }
}

/// Why a send to the next stage did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    Sent,
    Killed,
    Closed,
}

/// Send to the next stage, answering probes while the channel is full
pub async fn forward<T>(
    tx: &mpsc::Sender<T>,
    value: T,
    liveness: &mut Liveness,
    kill: &mut watch::Receiver<bool>,
) -> Forward {
    loop {
        tokio::select! {
            permit = tx.reserve() => {
                return match permit {
                    Ok(permit) => {
                        permit.send(value);
                        Forward::Sent
                    }
                    Err(_) => Forward::Closed,
                };
            }
            _ = liveness.probed() => liveness.reply(),
            _ = killed(kill) => return Forward::Killed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::supervisor::Supervisor;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_forward_blocked_until_capacity() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        let (_kill_tx, mut kill) = watch::channel(false);
        let mut liveness = Liveness::detached();

        assert_eq!(forward(&tx, 1, &mut liveness, &mut kill).await, Forward::Sent);

        let pending = tokio::spawn(async move {
            let mut liveness = Liveness::detached();
            forward(&tx, 2, &mut liveness, &mut kill).await
        });
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(pending.await.unwrap(), Forward::Sent);
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_forward_stops_on_kill_and_close() {
        let (tx, rx) = mpsc::channel::<u32>(1);
        let (kill_tx, mut kill) = watch::channel(false);
        let mut liveness = Liveness::detached();

        tx.try_send(0).unwrap();
        kill_tx.send(true).unwrap();
        assert_eq!(forward(&tx, 1, &mut liveness, &mut kill).await, Forward::Killed);

        drop(rx);
        let (_kill_tx, mut kill) = watch::channel(false);
        assert_eq!(forward(&tx, 2, &mut liveness, &mut kill).await, Forward::Closed);
    }

    #[tokio::test]
    async fn test_await_answering_replies_while_waiting() {
        let mut supervisor = Supervisor::new(Duration::from_millis(10));
        let mut liveness = supervisor.subscribe("images", Duration::from_secs(1));

        let t0 = Instant::now();
        supervisor.sweep(t0).unwrap();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        let job = tokio::spawn(async move {
            let _ = done_rx.await;
            7
        });

        let waiter = tokio::spawn(async move { await_answering(job, &mut liveness).await });
        // Give the waiter time to pick up the probe
        tokio::time::sleep(Duration::from_millis(50)).await;
        supervisor.sweep(t0 + Duration::from_millis(900)).unwrap();
        assert!(supervisor.sweep(t0 + Duration::from_millis(1800)).is_ok());

        done_tx.send(()).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }
}
