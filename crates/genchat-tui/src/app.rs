use genchat_core::{
    ConfigField, ConfigForm, ConfigFormError, EntryKind, FieldError, PreferenceStore, Session,
    SubmitOutcome, UiUpdate,
};
use ratatui::layout::Rect;
use tracing::{debug, warn};

/// How many ticks a notice stays on screen
const NOTICE_TICKS: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub text: String,
    pub is_error: bool,
    ticks_left: u8,
}

/// Modal settings editor over a [`ConfigForm`]
#[derive(Debug, Clone)]
pub struct ConfigDialog {
    pub form: ConfigForm,
    pub focus: ConfigField,
    pub errors: Vec<FieldError>,
}

impl ConfigDialog {
    pub fn error_for(&self, field: ConfigField) -> Option<&FieldError> {
        self.errors.iter().find(|e| e.field == field)
    }
}

pub struct App {
    pub should_quit: bool,
    pub session: Session,
    pub store: Box<dyn PreferenceStore + Send>,
    pub model_label: String,

    // Prompt input
    pub input: String,
    pub cursor: usize,
    pub use_streaming: bool,

    // Transcript view
    pub scroll: u16,
    /// Keep the view pinned to the newest entry
    pub follow: bool,
    pub chat_height: u16,
    pub chat_width: u16,
    pub chat_area: Option<Rect>,

    pub dialog: Option<ConfigDialog>,
    pub notice: Option<Notice>,
    pub animation_frame: u8,
}

impl App {
    pub fn new(
        session: Session,
        store: Box<dyn PreferenceStore + Send>,
        use_streaming: bool,
        model_label: String,
    ) -> Self {
        Self {
            should_quit: false,
            session,
            store,
            model_label,
            input: String::new(),
            cursor: 0,
            use_streaming,
            scroll: 0,
            follow: true,
            chat_height: 0,
            chat_width: 0,
            chat_area: None,
            dialog: None,
            notice: None,
            animation_frame: 0,
        }
    }

    /// Enter pressed: send the prompt, or cancel while generating
    pub fn submit(&mut self) {
        let prompt = self.input.clone();
        match self.session.submit(&prompt, self.use_streaming) {
            SubmitOutcome::Started(_) | SubmitOutcome::EngineUnavailable(_) => {
                self.input.clear();
                self.cursor = 0;
                self.follow = true;
            }
            SubmitOutcome::CancelRequested(id) => {
                debug!(request = id.0, "cancel requested from input");
            }
            SubmitOutcome::Rejected => {}
        }
        self.process_updates();
    }

    pub fn toggle_streaming(&mut self) {
        if self.session.affordances().streaming_toggle_enabled {
            self.use_streaming = !self.use_streaming;
        }
    }

    pub fn open_config(&mut self) {
        if !self.session.affordances().config_enabled {
            return;
        }
        self.dialog = Some(ConfigDialog {
            form: ConfigForm::load(self.store.as_ref()),
            focus: ConfigField::Temperature,
            errors: Vec::new(),
        });
    }

    pub fn cancel_config(&mut self) {
        self.dialog = None;
    }

    /// Save the dialog. Invalid fields keep it open with their messages.
    pub fn save_config(&mut self) {
        let Some(dialog) = self.dialog.as_mut() else {
            return;
        };
        match dialog.form.confirm(self.store.as_mut(), &mut self.session) {
            Ok(_) => {
                self.dialog = None;
            }
            Err(ConfigFormError::Invalid(errors)) => {
                if let Some(first) = errors.first() {
                    dialog.focus = first.field;
                }
                dialog.errors = errors;
            }
            Err(e @ ConfigFormError::Store(_)) => {
                warn!(error = %e, "failed to save settings");
                self.show_notice(format!("Could not save settings: {}", e), true);
            }
        }
        self.process_updates();
    }

    /// Let the session swap its engine for saved settings, then refresh
    pub async fn sync_engine(&mut self) {
        self.session.apply_pending_config().await;
        self.process_updates();
    }

    /// Drain session notifications into view state
    pub fn process_updates(&mut self) {
        for update in self.session.take_updates() {
            match update {
                UiUpdate::TranscriptChanged { .. } => {
                    if self.follow {
                        self.scroll_to_bottom();
                    }
                }
                UiUpdate::StateChanged(state) => {
                    debug!(?state, "state changed");
                    self.animation_frame = 0;
                }
                UiUpdate::ScrollTo(_) => {
                    self.follow = true;
                    self.scroll_to_bottom();
                }
                UiUpdate::Notice(text) => self.show_notice(text, false),
                UiUpdate::ConfigUpdated(params) => self.show_notice(
                    format!(
                        "Settings saved: temperature {}, top K {}, max tokens {}",
                        params.temperature, params.top_k, params.max_output_tokens
                    ),
                    false,
                ),
            }
        }
    }

    pub fn show_notice(&mut self, text: String, is_error: bool) {
        self.notice = Some(Notice {
            text,
            is_error,
            ticks_left: NOTICE_TICKS,
        });
    }

    /// Advance animations and expire notices (called by Tick event)
    pub fn tick(&mut self) {
        if self.session.state().is_generating() {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
        if let Some(notice) = self.notice.as_mut() {
            notice.ticks_left = notice.ticks_left.saturating_sub(1);
            if notice.ticks_left == 0 {
                self.notice = None;
            }
        }
    }

    /// Whether the view should show a placeholder for a response that has no text yet
    pub fn awaiting_first_text(&self) -> bool {
        self.session.state().is_generating()
            && self.session.transcript().streaming_index().is_none()
            && self
                .session
                .transcript()
                .last()
                .is_some_and(|e| e.kind == EntryKind::Request)
    }

    /// Number of wrapped lines the transcript occupies at the current width
    pub fn transcript_lines(&self) -> u16 {
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            50
        };

        let mut total: usize = 0;
        for entry in self.session.transcript().entries() {
            total += 1; // label line
            for line in entry.text.lines() {
                let chars = line.chars().count();
                total += chars / wrap_width + 1;
            }
            total += 1; // blank separator
        }
        if self.awaiting_first_text() {
            total += 2;
        }
        total.min(u16::MAX as usize) as u16
    }

    pub fn scroll_to_bottom(&mut self) {
        let visible = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };
        self.scroll = self.transcript_lines().saturating_sub(visible);
    }

    pub fn scroll_up(&mut self, lines: u16) {
        self.follow = false;
        self.scroll = self.scroll.saturating_sub(lines);
    }

    pub fn scroll_down(&mut self, lines: u16) {
        let visible = self.chat_height.max(1);
        let max = self.transcript_lines().saturating_sub(visible);
        self.scroll = self.scroll.saturating_add(lines).min(max);
        if self.scroll == max {
            self.follow = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use genchat_core::{
        Engine, EngineError, EngineFactory, GenerationParameters, MemoryPreferenceStore,
        SessionState, TextStream,
    };
    use std::sync::Arc;

    struct EchoEngine;

    #[async_trait::async_trait]
    impl Engine for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate_once(&self, prompt: &str) -> Result<String, EngineError> {
            Ok(format!("echo: {}", prompt))
        }

        async fn generate_stream(&self, prompt: &str) -> Result<TextStream, EngineError> {
            let words: Vec<Result<String, EngineError>> =
                prompt.split(' ').map(|w| Ok(format!("{} ", w))).collect();
            Ok(Box::pin(futures_util::stream::iter(words)))
        }
    }

    struct EchoFactory;

    impl EngineFactory for EchoFactory {
        fn initialize(&self, _params: &GenerationParameters) -> Result<Arc<dyn Engine>, EngineError> {
            Ok(Arc::new(EchoEngine))
        }
    }

    fn app() -> App {
        let session = Session::new(Arc::new(EchoFactory), GenerationParameters::default());
        App::new(session, Box::new(MemoryPreferenceStore::new()), false, "echo".to_string())
    }

    #[tokio::test]
    async fn test_empty_input_shows_notice() {
        let mut app = app();
        app.input = "   ".to_string();
        app.submit();
        assert!(app.session.transcript().is_empty());
        assert_eq!(app.notice.as_ref().map(|n| n.text.as_str()), Some("Prompt is empty"));
    }

    #[tokio::test]
    async fn test_submit_clears_input_and_locks_toggles() {
        let mut app = app();
        app.input = "Hello".to_string();
        app.cursor = 5;
        app.submit();

        assert!(app.input.is_empty());
        assert_eq!(app.cursor, 0);
        assert_eq!(app.session.state(), SessionState::Generating);

        app.toggle_streaming();
        assert!(!app.use_streaming);
        app.open_config();
        assert!(app.dialog.is_none());

        app.session.run_until_idle().await;
        app.process_updates();
        assert_eq!(app.session.transcript().last().unwrap().text, "echo: Hello");

        app.toggle_streaming();
        assert!(app.use_streaming);
    }

    #[tokio::test]
    async fn test_invalid_settings_keep_dialog_open() {
        let mut app = app();
        app.open_config();
        {
            let dialog = app.dialog.as_mut().unwrap();
            dialog.form.top_k = "lots".to_string();
        }
        app.save_config();

        let dialog = app.dialog.as_ref().expect("dialog should stay open");
        assert_eq!(dialog.focus, ConfigField::TopK);
        assert!(dialog.error_for(ConfigField::TopK).is_some());
        assert_eq!(app.session.params(), GenerationParameters::default());
    }

    #[tokio::test]
    async fn test_saved_settings_reach_session() {
        let mut app = app();
        app.open_config();
        app.dialog.as_mut().unwrap().form.temperature = "0.9".to_string();
        app.save_config();
        app.sync_engine().await;

        assert!(app.dialog.is_none());
        assert_eq!(app.session.params().temperature, 0.9);
        assert!(app.notice.as_ref().unwrap().text.starts_with("Settings saved"));
    }

    #[tokio::test]
    async fn test_notice_expires() {
        let mut app = app();
        app.show_notice("hi".to_string(), false);
        for _ in 0..NOTICE_TICKS {
            app.tick();
        }
        assert!(app.notice.is_none());
    }
}
