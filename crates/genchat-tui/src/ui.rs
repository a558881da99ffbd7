use ratatui::{
    Frame,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
};
use genchat_core::{ConfigField, EntryKind, SessionState};
use crate::app::{App, ConfigDialog};

/// Style `**bold**` and `` `code` `` spans in a line of model output.
/// Unterminated markers are kept as literal text.
fn parse_markdown_line(text: &str) -> Line<'static> {
    let mut spans: Vec<Span<'static>> = Vec::new();
    let mut plain = String::new();
    let mut rest = text;

    while !rest.is_empty() {
        let bold = rest.find("**");
        let code = rest.find('`');
        let (start, marker, style) = match (bold, code) {
            (Some(b), Some(c)) if c < b => (c, "`", Style::default().fg(Color::Green)),
            (Some(b), _) => (b, "**", Style::default().add_modifier(Modifier::BOLD)),
            (None, Some(c)) => (c, "`", Style::default().fg(Color::Green)),
            (None, None) => break,
        };

        let after = &rest[start + marker.len()..];
        match after.find(marker) {
            Some(end) => {
                plain.push_str(&rest[..start]);
                if !plain.is_empty() {
                    spans.push(Span::raw(std::mem::take(&mut plain)));
                }
                if end > 0 {
                    spans.push(Span::styled(after[..end].to_string(), style));
                }
                rest = &after[end + marker.len()..];
            }
            None => {
                // No closing marker: keep it as text and scan past it
                plain.push_str(&rest[..start + marker.len()]);
                rest = after;
            }
        }
    }

    plain.push_str(rest);
    if !plain.is_empty() {
        spans.push(Span::raw(plain));
    }
    Line::from(spans)
}

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    // Main layout: header, transcript, notice, input, footer
    let [header_area, chat_area, notice_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(3),
        Constraint::Length(1),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_transcript(app, frame, chat_area);
    render_notice(app, frame, notice_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);

    if let Some(dialog) = &app.dialog {
        render_config_dialog(dialog, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let (state_text, state_style) = match app.session.state() {
        SessionState::Idle => (" idle ", Style::default().fg(Color::Green)),
        SessionState::Generating if app.session.cancel_requested() => {
            (" cancelling ", Style::default().fg(Color::Red))
        }
        SessionState::Generating => (" generating ", Style::default().fg(Color::Yellow)),
    };
    let params = app.session.params();

    let title = Line::from(vec![
        Span::styled(" genchat ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::Gray),
        ),
        Span::raw("  "),
        Span::styled(app.model_label.clone(), Style::default().fg(Color::White)),
        Span::styled(
            format!(
                "  t={} k={} max={}",
                params.temperature, params.top_k, params.max_output_tokens
            ),
            Style::default().fg(Color::Gray),
        ),
        Span::raw(" "),
        Span::styled(state_text, state_style.add_modifier(Modifier::BOLD)),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn render_transcript(app: &mut App, frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" Conversation ");

    let inner = block.inner(area);
    app.chat_area = Some(area);
    app.chat_height = inner.height;
    app.chat_width = inner.width;

    let transcript = app.session.transcript();
    let text = if transcript.is_empty() {
        Text::from(Span::styled(
            "Type a prompt below and press Enter...",
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        let mut lines: Vec<Line> = Vec::new();

        for entry in transcript.entries() {
            match entry.kind {
                EntryKind::Request => {
                    lines.push(Line::from(Span::styled(
                        "You:",
                        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                    )));
                    for line in entry.text.lines() {
                        lines.push(Line::from(line.to_string()));
                    }
                }
                EntryKind::Response => {
                    lines.push(Line::from(Span::styled(
                        "AI:",
                        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                    )));
                    for line in entry.text.lines() {
                        lines.push(parse_markdown_line(line));
                    }
                }
                EntryKind::ErrorResponse => {
                    lines.push(Line::from(Span::styled(
                        "Error:",
                        Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
                    )));
                    for line in entry.text.lines() {
                        lines.push(Line::from(Span::styled(
                            line.to_string(),
                            Style::default().fg(Color::Red),
                        )));
                    }
                }
            }
            lines.push(Line::default());
        }

        if app.awaiting_first_text() {
            lines.push(Line::from(Span::styled(
                "AI:",
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            )));
            // Animated ellipsis: cycles through ".", "..", "..."
            let dots = ".".repeat(app.animation_frame as usize + 1);
            lines.push(Line::from(Span::styled(
                format!("Thinking{}", dots),
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
            )));
        }

        Text::from(lines)
    };

    let chat = Paragraph::new(text)
        .block(block)
        .wrap(Wrap { trim: false })
        .scroll((app.scroll, 0));

    frame.render_widget(chat, area);
}

fn render_notice(app: &App, frame: &mut Frame, area: Rect) {
    let Some(notice) = &app.notice else {
        return;
    };
    let style = if notice.is_error {
        Style::default().fg(Color::Red)
    } else {
        Style::default().fg(Color::Yellow)
    };
    frame.render_widget(Paragraph::new(format!(" {}", notice.text)).style(style), area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let affordances = app.session.affordances();
    let border_color = if affordances.submit_is_cancel {
        Color::Red
    } else {
        Color::Yellow
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(format!(" Prompt  [Enter] {} ", affordances.submit_label));

    let inner = block.inner(area);
    let input = Paragraph::new(app.input.as_str()).block(block);
    frame.render_widget(input, area);

    if app.dialog.is_none() {
        // Keep the cursor visible when the prompt is wider than the box
        let width = inner.width.max(1) as usize;
        let offset = app.cursor.saturating_sub(width - 1);
        if offset == 0 {
            frame.set_cursor_position((inner.x + app.cursor as u16, inner.y));
        } else {
            let visible: String = app.input.chars().skip(offset).collect();
            let input = Paragraph::new(visible);
            frame.render_widget(Clear, inner);
            frame.render_widget(input, inner);
            frame.set_cursor_position((inner.x + (app.cursor - offset) as u16, inner.y));
        }
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let affordances = app.session.affordances();
    let enabled = |on: bool| {
        if on {
            Style::default().fg(Color::White)
        } else {
            Style::default().fg(Color::DarkGray)
        }
    };

    let streaming = if app.use_streaming { "on" } else { "off" };
    let footer = Line::from(vec![
        Span::styled(
            format!(" ^S streaming: {} ", streaming),
            enabled(affordances.streaming_toggle_enabled),
        ),
        Span::styled(" ^G settings ", enabled(affordances.config_enabled)),
        Span::styled(" ↑↓/PgUp/PgDn scroll ", Style::default().fg(Color::Gray)),
        Span::styled(" Esc quit ", Style::default().fg(Color::Gray)),
    ]);
    frame.render_widget(
        Paragraph::new(footer).style(Style::default().bg(Color::Blue)),
        area,
    );
}

fn render_config_dialog(dialog: &ConfigDialog, frame: &mut Frame, area: Rect) {
    let fields = ConfigField::all();

    // Calculate popup size and position (centered)
    let popup_width = 50.min(area.width.saturating_sub(4));
    let popup_height = (fields.len() as u16 * 2 + 4).min(area.height.saturating_sub(2));

    let popup_x = (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = (area.height.saturating_sub(popup_height)) / 2;

    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    // Clear the area behind the popup
    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" Generation Settings (Enter save, Esc cancel) ");

    let inner = block.inner(popup_area);
    frame.render_widget(block, popup_area);

    let mut lines: Vec<Line> = Vec::new();
    for field in &fields {
        let focused = *field == dialog.focus;
        let label_style = if focused {
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };
        let marker = if focused { "> " } else { "  " };
        lines.push(Line::from(vec![
            Span::styled(format!("{}{:<18}", marker, field.label()), label_style),
            Span::styled(
                dialog.form.field(*field).to_string(),
                Style::default().fg(Color::Yellow),
            ),
        ]));

        match dialog.error_for(*field) {
            Some(error) => lines.push(Line::from(Span::styled(
                format!("    {}", error.message),
                Style::default().fg(Color::Red),
            ))),
            None => lines.push(Line::default()),
        }
    }

    frame.render_widget(Paragraph::new(lines), inner);

    if let Some(index) = fields.iter().position(|f| *f == dialog.focus) {
        let value_len = dialog.form.field(dialog.focus).chars().count() as u16;
        let x = (inner.x + 20 + value_len).min(inner.x + inner.width.saturating_sub(1));
        frame.set_cursor_position((x, inner.y + index as u16 * 2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(line: &Line) -> Vec<(String, bool)> {
        line.spans
            .iter()
            .map(|s| {
                (
                    s.content.to_string(),
                    s.style.add_modifier.contains(Modifier::BOLD),
                )
            })
            .collect()
    }

    #[test]
    fn test_markdown_bold() {
        let line = parse_markdown_line("a **b** c");
        assert_eq!(
            rendered(&line),
            vec![
                ("a ".to_string(), false),
                ("b".to_string(), true),
                (" c".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_markdown_unterminated_is_literal() {
        let line = parse_markdown_line("2 ** 3");
        assert_eq!(rendered(&line), vec![("2 ** 3".to_string(), false)]);
    }

    #[test]
    fn test_markdown_unterminated_then_code() {
        let line = parse_markdown_line("2 ** 3 `x`");
        assert_eq!(
            rendered(&line),
            vec![("2 ** 3 ".to_string(), false), ("x".to_string(), false)]
        );
        assert_eq!(line.spans[1].style.fg, Some(Color::Green));

        let line = parse_markdown_line("`a **b**");
        assert_eq!(
            rendered(&line),
            vec![("`a ".to_string(), false), ("b".to_string(), true)]
        );
    }

    #[test]
    fn test_markdown_code_before_bold() {
        let line = parse_markdown_line("`x**y` ok");
        assert_eq!(
            rendered(&line),
            vec![("x**y".to_string(), false), (" ok".to_string(), false)]
        );
    }
}
