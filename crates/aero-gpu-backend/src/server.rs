use std::future::Future;

use aero_gpu_notify::Listener;

use crate::config::BackendConfig;
use crate::error::Result;
use crate::executor::CommandExecutor;
use crate::resolver::ShmResolver;
use crate::session::BackendSession;

/// Serves relay connections one at a time until `shutdown` resolves.
///
/// A connection whose handshake fails is dropped and the next one accepted. On shutdown the
/// active session is stopped and its link closed before this returns.
pub async fn serve<E, F, S>(
    listener: &Listener,
    config: &BackendConfig,
    resolver: &dyn ShmResolver,
    mut new_executor: F,
    shutdown: S,
) -> Result<()>
where
    E: CommandExecutor,
    F: FnMut() -> E,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let conn = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            res = listener.accept() => res?,
        };

        let session = tokio::select! {
            _ = &mut shutdown => return Ok(()),
            res = BackendSession::accept(conn, config, resolver, new_executor()) => match res {
                Ok(session) => session,
                Err(err) => {
                    tracing::warn!(error = %err, "handshake failed");
                    continue;
                }
            },
        };

        let stop = session.stop_handle();
        let run = session.run();
        tokio::pin!(run);
        let summary = tokio::select! {
            summary = &mut run => summary,
            _ = &mut shutdown => {
                stop.stop();
                let summary = run.await;
                tracing::info!(?summary, "session stopped for shutdown");
                return Ok(());
            }
        };
        tracing::info!(?summary, "session finished");
    }
}
