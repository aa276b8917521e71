// src/server.rs
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, TickSource};
use crate::error::EtudeResult;
use crate::metrics::ServerContext;
use crate::signal::{ShutdownHandle, SignalPipe};

/// A bound, not yet running server.
///
/// ```rust,ignore
/// let mut server = Server::bind(Config::new(8080, "/srv/www"))?;
/// server.install_signal_handlers()?;
/// server.serve()?;
/// ```
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    signals: SignalPipe,
    tick_source: TickSource,
}

impl Server {
    /// Validate `config` and bind the listening socket (`SO_REUSEADDR` is
    /// set by the standard library on unix).
    pub fn bind(config: Config) -> EtudeResult<Self> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        info!(
            %addr,
            root = %config.doc_root.display(),
            threads = config.threads,
            "listening"
        );

        Ok(Self {
            ctx: Arc::new(ServerContext::new(config)),
            listener,
            signals: SignalPipe::new()?,
            tick_source: TickSource::Deadline,
        })
    }

    pub fn local_addr(&self) -> EtudeResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// A handle that stops [`serve`](Server::serve) from any thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.signals.shutdown_handle()
    }

    /// Route `SIGINT`/`SIGTERM`/`SIGHUP` to a graceful shutdown, ignore
    /// `SIGPIPE` and drive timer sweeps from `SIGALRM`. Process-wide, so
    /// only the binary calls this.
    pub fn install_signal_handlers(&mut self) -> EtudeResult<()> {
        self.signals.install(self.ctx.config.timeout_unit)?;
        self.tick_source = TickSource::Alarm;
        Ok(())
    }

    /// Run the dispatcher on the calling thread until shutdown.
    pub fn serve(self) -> EtudeResult<()> {
        let mut dispatcher =
            Dispatcher::new(self.ctx, self.listener, self.signals, self.tick_source)?;
        dispatcher.run()
    }
}
