//! One translator session: one adapter child, one client channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use dap_session::AdapterSession;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::{
    breakpoints::BreakpointLedger,
    callback::ClientCallback,
    config::SessionConfig,
    error::BridgeError,
    events::EventTranslator,
    files::FileCache,
    protocol::ClientCommand,
    router::{CommandRouter, SessionFlags},
    threads::ThreadRegistry,
};

struct SessionCore {
    adapter: Arc<AdapterSession>,
    callback: Arc<dyn ClientCallback>,
    disposed: AtomicBool,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SessionCore {
    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.adapter.dispose().await;
        self.callback.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// The translator session. Owns the adapter session, the shared breakpoint
/// and thread state, the command router, and the event translator; commands
/// come in on a channel, everything outbound converges on the
/// [`ClientCallback`] sink.
pub struct BridgeSession {
    core: Arc<SessionCore>,
}

impl BridgeSession {
    /// Spawn the adapter, negotiate capabilities, and start consuming
    /// client commands. Launch/attach itself is deferred until the client
    /// signals the end of configuration with its first `Debugger.resume`.
    pub async fn start(
        config: SessionConfig,
        commands: mpsc::UnboundedReceiver<ClientCommand>,
        callback: Arc<dyn ClientCallback>,
        files: Arc<dyn FileCache>,
    ) -> Result<Self, BridgeError> {
        let adapter = Arc::new(
            AdapterSession::spawn(&config.descriptor, config.adapter_kind.adapter_id()).await?,
        );

        let registry = Arc::new(Mutex::new(ThreadRegistry::new()));
        let ledger = Arc::new(BreakpointLedger::new(adapter.clone(), callback.clone()));
        let flags = Arc::new(Mutex::new(SessionFlags::default()));
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();

        // Subscribe the translator before `initialize` goes out so the very
        // first adapter events cannot slip past it.
        let translator = EventTranslator::new(
            adapter.clone(),
            ledger.clone(),
            registry.clone(),
            callback.clone(),
            flags.clone(),
            config.adapter_kind,
        );
        let mut tasks = translator.start().await;

        if let Err(err) = adapter.initialize().await {
            for task in tasks {
                task.abort();
            }
            adapter.dispose().await;
            return Err(err.into());
        }

        let router = Arc::new(CommandRouter::new(
            adapter.clone(),
            ledger,
            registry,
            callback.clone(),
            files,
            config,
            flags,
            fatal_tx,
        ));

        let core = Arc::new(SessionCore {
            adapter,
            callback,
            disposed: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        // Command pump: arrival order in, one handler at a time. Adapter
        // reads and event translation run on their own tasks, so a handler
        // suspended on an adapter round-trip never stalls them.
        let pump_router = router.clone();
        tasks.push(tokio::spawn(async move {
            let mut commands = commands;
            while let Some(command) = commands.recv().await {
                pump_router.handle_command(command).await;
            }
        }));

        // A failed launch/attach is terminal: tear the session down.
        let watcher_core = core.clone();
        tasks.push(tokio::spawn(async move {
            if fatal_rx.recv().await.is_some() {
                watcher_core.dispose().await;
            }
        }));

        core.tasks.lock().extend(tasks);
        Ok(Self { core })
    }

    /// Fires once when the session is over: debuggee exit, terminate (after
    /// a one-second output flush grace), or adapter process death.
    pub async fn observe_session_end(&self) -> mpsc::UnboundedReceiver<()> {
        self.core.adapter.observe_session_end().await
    }

    /// Tear everything down: adapter child, pending requests, event pumps,
    /// and the client sink. A second call is a no-op.
    pub async fn dispose(&self) {
        self.core.dispose().await;
    }
}
