use crossterm::event::{KeyCode, KeyEvent, KeyModifiers, MouseEvent, MouseEventKind};
use ratatui::layout::Rect;
use crate::app::App;
use crate::tui::AppEvent;

/// Convert a character index to a byte index for UTF-8 safe string operations
fn char_to_byte_index(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

pub fn handle_event(app: &mut App, event: AppEvent) {
    match event {
        AppEvent::Key(key) => handle_key(app, key),
        AppEvent::Mouse(mouse) => handle_mouse(app, mouse),
        AppEvent::Paste(text) => handle_paste(app, &text),
        AppEvent::Resize(_, _) => {
            if app.follow {
                app.scroll_to_bottom();
            }
        }
        AppEvent::Tick => app.tick(),
    }
}

fn handle_key(app: &mut App, key: KeyEvent) {
    // Global keys that work in any mode
    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
        app.should_quit = true;
        return;
    }

    if app.dialog.is_some() {
        handle_dialog_key(app, key);
    } else {
        handle_chat_key(app, key);
    }
}

fn handle_chat_key(app: &mut App, key: KeyEvent) {
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Esc => app.should_quit = true,
        KeyCode::Enter => app.submit(),
        KeyCode::Char('s') if ctrl => app.toggle_streaming(),
        KeyCode::Char('g') if ctrl => app.open_config(),

        // Transcript scrolling
        KeyCode::Up => app.scroll_up(1),
        KeyCode::Down => app.scroll_down(1),
        KeyCode::PageUp => app.scroll_up((app.chat_height / 2).max(1)),
        KeyCode::PageDown => app.scroll_down((app.chat_height / 2).max(1)),

        // Prompt editing
        KeyCode::Backspace => {
            if app.cursor > 0 {
                app.cursor -= 1;
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Delete => {
            if app.cursor < app.input.chars().count() {
                let byte_pos = char_to_byte_index(&app.input, app.cursor);
                app.input.remove(byte_pos);
            }
        }
        KeyCode::Left => {
            app.cursor = app.cursor.saturating_sub(1);
        }
        KeyCode::Right => {
            app.cursor = (app.cursor + 1).min(app.input.chars().count());
        }
        KeyCode::Home => {
            app.cursor = 0;
        }
        KeyCode::End => {
            app.cursor = app.input.chars().count();
        }
        KeyCode::Char('u') if ctrl => {
            app.input.clear();
            app.cursor = 0;
        }
        KeyCode::Char(c) if !ctrl => {
            let byte_pos = char_to_byte_index(&app.input, app.cursor);
            app.input.insert(byte_pos, c);
            app.cursor += 1;
        }
        _ => {}
    }
}

fn handle_dialog_key(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Esc => app.cancel_config(),
        KeyCode::Enter => app.save_config(),
        KeyCode::Tab | KeyCode::Down => {
            if let Some(dialog) = app.dialog.as_mut() {
                dialog.focus = dialog.focus.next();
            }
        }
        KeyCode::BackTab | KeyCode::Up => {
            if let Some(dialog) = app.dialog.as_mut() {
                dialog.focus = dialog.focus.previous();
            }
        }
        KeyCode::Backspace => {
            if let Some(dialog) = app.dialog.as_mut() {
                dialog.form.field_mut(dialog.focus).pop();
            }
        }
        KeyCode::Char(c) if !c.is_control() => {
            if let Some(dialog) = app.dialog.as_mut() {
                dialog.form.field_mut(dialog.focus).push(c);
            }
        }
        _ => {}
    }
}

fn handle_paste(app: &mut App, text: &str) {
    // The prompt is a single line
    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();

    if let Some(dialog) = app.dialog.as_mut() {
        dialog.form.field_mut(dialog.focus).push_str(flattened.trim());
        return;
    }

    let byte_pos = char_to_byte_index(&app.input, app.cursor);
    app.input.insert_str(byte_pos, &flattened);
    app.cursor += flattened.chars().count();
}

/// Check if a point is within a rectangle
fn point_in_rect(x: u16, y: u16, rect: Rect) -> bool {
    x >= rect.x && x < rect.x + rect.width && y >= rect.y && y < rect.y + rect.height
}

fn handle_mouse(app: &mut App, mouse: MouseEvent) {
    let in_chat = app
        .chat_area
        .map(|r| point_in_rect(mouse.column, mouse.row, r))
        .unwrap_or(false);
    if !in_chat || app.dialog.is_some() {
        return;
    }

    match mouse.kind {
        MouseEventKind::ScrollDown => app.scroll_down(3),
        MouseEventKind::ScrollUp => app.scroll_up(3),
        _ => {}
    }
}
