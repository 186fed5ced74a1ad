use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

/// Sink for everything the bridge sends toward the UI shell: wire messages,
/// toast-level notifications, and user-visible output lines.
pub trait ClientCallback: Send + Sync {
    /// A serialized client-protocol message (response or event).
    fn send_chrome_message(&self, message: String);
    /// A toast-level notification (`info`, `warning`, `error`, ...).
    fn send_notification(&self, level: &str, message: &str);
    /// A line of debuggee/debugger output with a display level.
    fn send_user_output(&self, level: &str, text: &str);
    /// Close the sink. Later sends are dropped; calling twice is a no-op.
    fn close(&self) {}
}

/// Receiver halves paired with a [`ChannelClientCallback`].
pub struct ClientChannels {
    pub messages: mpsc::UnboundedReceiver<String>,
    pub notifications: mpsc::UnboundedReceiver<(String, String)>,
    pub outputs: mpsc::UnboundedReceiver<(String, String)>,
}

/// Channel-backed [`ClientCallback`] for embedding and tests.
pub struct ChannelClientCallback {
    messages: mpsc::UnboundedSender<String>,
    notifications: mpsc::UnboundedSender<(String, String)>,
    outputs: mpsc::UnboundedSender<(String, String)>,
    closed: AtomicBool,
}

impl ChannelClientCallback {
    pub fn new() -> (Self, ClientChannels) {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();
        let (outputs_tx, outputs_rx) = mpsc::unbounded_channel();
        (
            Self {
                messages: messages_tx,
                notifications: notifications_tx,
                outputs: outputs_tx,
                closed: AtomicBool::new(false),
            },
            ClientChannels {
                messages: messages_rx,
                notifications: notifications_rx,
                outputs: outputs_rx,
            },
        )
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ClientCallback for ChannelClientCallback {
    fn send_chrome_message(&self, message: String) {
        if self.is_closed() {
            return;
        }
        let _ = self.messages.send(message);
    }

    fn send_notification(&self, level: &str, message: &str) {
        if self.is_closed() {
            return;
        }
        let _ = self
            .notifications
            .send((level.to_string(), message.to_string()));
    }

    fn send_user_output(&self, level: &str, text: &str) {
        if self.is_closed() {
            return;
        }
        let _ = self.outputs.send((level.to_string(), text.to_string()));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
