use std::sync::{
    Arc, Once,
    atomic::{AtomicBool, Ordering},
};

use tracing::{info, warn};

/// Cooperative cancellation flag shared between a run and its controller.
///
/// The driver polls it between frames; a frame already in flight always
/// finishes first.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Route Ctrl+C to `token`. Only the first call installs a handler.
pub fn cancel_on_ctrl_c(token: &CancelToken) {
    static CTRL_HANDLER: Once = Once::new();

    let handler = interrupt_handler(token.clone());
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(handler) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

/// Handler body for the signal thread. It logs through the dispatcher that is
/// current here, since the subscriber is installed per thread.
fn interrupt_handler(token: CancelToken) -> impl FnMut() + Send + 'static {
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    move || {
        tracing::dispatcher::with_default(&dispatch, || {
            info!("Ctrl+C received, cancelling after the current frame");
        });
        token.cancel();
    }
}
