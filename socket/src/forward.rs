use tokio::{io::AsyncWriteExt, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::server::IoStream;

/// Copies bytes between `a` and `b` in both directions until either both
/// directions have reached end-of-stream on their own, or `cancellation`
/// fires, in which case the outstanding copies are torn down immediately.
///
/// Per-direction copy errors count the same as end-of-stream. When one
/// direction finishes, the receiving side's write half is shut down so
/// the peer observes EOF. Both streams are consumed by the relay and are
/// fully closed once it returns; both copy tasks are guaranteed to have
/// finished by then.
pub async fn forward<A, B>(a: A, b: B, cancellation: &CancellationToken)
where
    A: IoStream,
    B: IoStream,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut copies: JoinSet<()> = JoinSet::new();
    copies.spawn(async move {
        let _ = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
    });
    copies.spawn(async move {
        let _ = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
    });

    loop {
        tokio::select! {
            () = cancellation.cancelled() => {
                copies.abort_all();
                break;
            }
            res = copies.join_next() => {
                if res.is_none() {
                    return;
                }
            }
        }
    }

    while copies.join_next().await.is_some() {}
}
