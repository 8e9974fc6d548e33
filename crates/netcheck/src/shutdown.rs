// Shutdown on SIGTERM or SIGINT.

use std::future::{Future, pending};
use std::io;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Cancel `shutdown` on SIGTERM or SIGINT. Without a SIGTERM handler,
/// SIGINT still works.
pub async fn cancel_on_signal(shutdown: CancellationToken) {
    let mut terminate = signal(SignalKind::terminate())
        .inspect_err(|err| error!(error = %err, "cannot install SIGTERM handler, stopping on SIGINT only"))
        .ok();

    let received = first_signal(terminate.as_mut().map(|stream| stream.recv()), tokio::signal::ctrl_c()).await;
    info!(signal = received, "stopping after the current tick");
    shutdown.cancel();
}

/// Name of the first signal to arrive. A missing `terminate` future or a
/// failed `interrupt` listener never resolves.
async fn first_signal<T, I>(terminate: Option<T>, interrupt: I) -> &'static str
where
    T: Future<Output = Option<()>>,
    I: Future<Output = io::Result<()>>,
{
    let terminate = async {
        match terminate {
            Some(recv) => {
                recv.await;
            }
            None => pending::<()>().await,
        }
    };
    let interrupt = async {
        if let Err(err) = interrupt.await {
            error!(error = %err, "cannot listen for SIGINT");
            pending::<()>().await;
        }
    };

    tokio::select! {
        () = terminate => "SIGTERM",
        () = interrupt => "SIGINT",
    }
}

#[cfg(test)]
mod tests {
    use std::future::{Pending, ready};

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn interrupt_alone_stops_without_terminate_handler() {
        let received = first_signal(None::<Pending<Option<()>>>, ready(Ok(()))).await;
        assert_eq!(received, "SIGINT");
    }

    #[tokio::test]
    async fn terminate_stops() {
        let received = first_signal(Some(ready(Some(()))), pending::<io::Result<()>>()).await;
        assert_eq!(received, "SIGTERM");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_interrupt_listener_waits_for_terminate() {
        let terminate = async {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            Some(())
        };
        let interrupt = ready(Err(io::Error::other("no signal driver")));
        assert_eq!(first_signal(Some(terminate), interrupt).await, "SIGTERM");
    }
}
