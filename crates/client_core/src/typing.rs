use std::{sync::Arc, time::Duration};

use tokio::{sync::Mutex, task::JoinHandle};

pub type TypingSink = Arc<dyn Fn(bool) + Send + Sync>;

/// Debounces the local typing indicator.
///
/// The first keystroke after an idle period reports `true`; every keystroke
/// restarts the idle window and its expiry reports a single `false`.
#[derive(Clone)]
pub struct TypingDebouncer {
    window: Duration,
    sink: TypingSink,
    state: Arc<Mutex<TypingState>>,
}

#[derive(Default)]
struct TypingState {
    typing: bool,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl TypingDebouncer {
    pub fn new(window: Duration, sink: TypingSink) -> Self {
        Self {
            window,
            sink,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    pub async fn keystroke(&self) {
        let mut state = self.state.lock().await;
        if !state.typing {
            state.typing = true;
            (self.sink)(true);
        }
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let generation = state.generation;
        let debouncer = self.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debouncer.window).await;
            let mut state = debouncer.state.lock().await;
            if state.generation == generation && state.typing {
                state.typing = false;
                state.timer = None;
                (debouncer.sink)(false);
            }
        }));
    }

    /// Ends the window now, reporting `false` if typing was reported.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.typing {
            state.typing = false;
            (self.sink)(false);
        }
    }

    pub async fn is_typing(&self) -> bool {
        self.state.lock().await.typing
    }
}
