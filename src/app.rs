// --- Terminal Chat UI ---

use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::{prelude::*, text::Line, widgets::*};
use tokio::sync::mpsc;

use crate::conversation::ConversationController;
use crate::display::DisplayEvent;
use crate::error::{AppError, StreamError};
use crate::markdown::render_markdown;
use crate::store::{Conversation, Message, MessageId, MessageStatus, Role};

enum InputMode {
    Normal,
    Editing,
}

/// What applying a display event means for the status bar.
#[derive(Debug, PartialEq)]
pub enum Notice {
    None,
    Finished,
    Failed(String),
}

/// Applies `event` to the message it names. Messages are looked up by id,
/// never by position; events for messages not on screen are dropped.
pub fn apply_display_event(messages: &mut [Message], event: DisplayEvent) -> Notice {
    match event {
        DisplayEvent::Snapshot { message_id, text } => {
            if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
                message.content = text;
            }
            Notice::None
        }
        DisplayEvent::Completed { message_id, text } => {
            if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
                message.content = text;
                message.is_streaming = false;
                message.status = MessageStatus::Sent;
            }
            Notice::Finished
        }
        DisplayEvent::Failed { message_id, error } => {
            if let Some(message) = messages.iter_mut().find(|m| m.id == message_id) {
                message.is_streaming = false;
                message.status = MessageStatus::Error;
            }
            Notice::Failed(error)
        }
    }
}

pub struct App {
    input_mode: InputMode,
    input_buffer: String,
    messages: Vec<Message>,
    conversations: Vec<Conversation>,
    status_message: String,
    scroll_offset: u16,
    /// Index into `messages` of the message `e`/`d` act on.
    selected: Option<usize>,
    /// Set while the input box holds an edit of an existing message.
    editing: Option<MessageId>,
    controller: ConversationController,
    event_receiver: mpsc::Receiver<DisplayEvent>,
}

impl App {
    pub fn new(controller: ConversationController, event_receiver: mpsc::Receiver<DisplayEvent>) -> Self {
        App {
            input_mode: InputMode::Normal,
            input_buffer: String::new(),
            messages: Vec::new(),
            conversations: Vec::new(),
            status_message: "Press 'Enter' to type (Ctrl+S to send).".to_string(),
            scroll_offset: 0,
            selected: None,
            editing: None,
            controller,
            event_receiver,
        }
    }

    pub async fn start(&mut self) {
        self.controller.new_conversation().await;
        self.refresh().await;
    }

    async fn refresh(&mut self) {
        self.messages = self.controller.messages().await;
        self.conversations = self.controller.conversations().await;
        self.selected = match (self.selected, self.messages.len()) {
            (_, 0) => None,
            (Some(i), len) => Some(i.min(len - 1)),
            (None, _) => None,
        };
    }

    fn selected_message(&self) -> Option<&Message> {
        self.selected.and_then(|i| self.messages.get(i))
    }

    fn select_next(&mut self) {
        if self.messages.is_empty() {
            return;
        }
        let last = self.messages.len() - 1;
        self.selected = Some(self.selected.map_or(0, |i| (i + 1).min(last)));
    }

    fn select_previous(&mut self) {
        if self.messages.is_empty() {
            return;
        }
        let last = self.messages.len() - 1;
        self.selected = Some(self.selected.map_or(last, |i| i.saturating_sub(1)));
    }

    /// Loads the selected message into the input box for editing.
    fn begin_edit(&mut self) {
        let Some((id, content, is_streaming)) = self
            .selected_message()
            .map(|m| (m.id, m.content.clone(), m.is_streaming))
        else {
            self.status_message = "Select a message with '[' or ']' first.".to_string();
            return;
        };
        if is_streaming {
            self.status_message = "Cannot edit a reply while it streams.".to_string();
            return;
        }
        self.editing = Some(id);
        self.input_buffer = content;
        self.input_mode = InputMode::Editing;
        self.status_message = "Editing message... Ctrl+S: Save, Esc: Discard.".to_string();
    }

    async fn save_edit(&mut self, id: MessageId) {
        let content = std::mem::take(&mut self.input_buffer);
        match self.controller.edit_message(id, &content).await {
            Ok(()) => self.status_message = "Message edited.".to_string(),
            Err(e) => self.status_message = format!("Error editing message: {}", e),
        }
        self.editing = None;
        self.input_mode = InputMode::Normal;
        self.refresh().await;
    }

    /// Deletes the selected message; a reply still streaming is cancelled.
    async fn delete_selected(&mut self) {
        let Some(id) = self.selected_message().map(|m| m.id) else {
            self.status_message = "Select a message with '[' or ']' first.".to_string();
            return;
        };
        match self.controller.delete_message(id).await {
            Ok(()) => self.status_message = "Message deleted.".to_string(),
            Err(e) => self.status_message = format!("Error deleting message: {}", e),
        }
        self.refresh().await;
    }

    async fn submit_input(&mut self) {
        match self.editing {
            Some(id) => self.save_edit(id).await,
            None => self.submit_prompt().await,
        }
    }

    fn is_loading(&self) -> bool {
        self.controller.is_streaming()
    }

    async fn submit_prompt(&mut self) {
        let prompt = std::mem::take(&mut self.input_buffer);
        match self.controller.send_message(&prompt).await {
            Ok(Some(_)) => {
                self.status_message = "Waiting for reply... (x: cancel)".to_string();
                self.scroll_offset = 0;
                self.refresh().await;
            }
            Ok(None) => {
                self.status_message = "Cannot send an empty prompt.".to_string();
            }
            Err(e @ StreamError::AlreadyStreaming(_)) => {
                self.input_buffer = prompt;
                self.status_message = format!("{}. Press 'x' to cancel it.", e);
            }
            Err(e) => {
                self.input_buffer = prompt;
                self.status_message = format!("Error sending message: {}", e);
            }
        }
        self.input_mode = InputMode::Normal;
    }

    async fn switch_conversation(&mut self, step: isize) {
        if self.conversations.is_empty() {
            return;
        }
        let current = self.controller.current_conversation();
        let index = self
            .conversations
            .iter()
            .position(|c| Some(c.id) == current)
            .unwrap_or(0) as isize;
        let len = self.conversations.len() as isize;
        let next = self.conversations[(index + step).rem_euclid(len) as usize].id;

        match self.controller.load_conversation(next).await {
            Ok(messages) => {
                self.messages = messages;
                self.scroll_offset = 0;
                self.selected = None;
            }
            Err(e) => self.status_message = format!("Error loading conversation: {}", e),
        }
    }

    fn handle_display_event(&mut self, event: DisplayEvent) {
        match apply_display_event(&mut self.messages, event) {
            Notice::None => {}
            Notice::Finished => {
                self.status_message = "Response received. Press 'Enter' to type (Ctrl+S to send).".to_string();
            }
            Notice::Failed(error) => {
                self.status_message = format!("Error: {}", error);
            }
        }
    }

    fn scroll_down(&mut self, amount: u16) {
        self.scroll_offset = self.scroll_offset.saturating_add(amount);
    }

    fn scroll_up(&mut self, amount: u16) {
        self.scroll_offset = self.scroll_offset.saturating_sub(amount);
    }
}

// --- Main Event Loop ---
pub async fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<(), AppError> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        if event::poll(Duration::from_millis(50))? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => match app.input_mode {
                    InputMode::Normal => match key.code {
                        KeyCode::Char('q') => return Ok(()),
                        KeyCode::Enter => {
                            app.input_mode = InputMode::Editing;
                            app.status_message =
                                "Editing prompt... Enter: Newline, Ctrl+S: Send, Esc: Cancel.".to_string();
                        }
                        KeyCode::Char('x') => {
                            if app.controller.cancel_stream() {
                                app.status_message = "Reply cancelled.".to_string();
                                // The stream task updates the store on its own schedule.
                                for message in app.messages.iter_mut().filter(|m| m.is_streaming) {
                                    message.is_streaming = false;
                                    message.status = MessageStatus::Error;
                                }
                            }
                        }
                        KeyCode::Char(']') => app.select_next(),
                        KeyCode::Char('[') => app.select_previous(),
                        KeyCode::Char('e') => app.begin_edit(),
                        KeyCode::Char('d') | KeyCode::Delete => app.delete_selected().await,
                        KeyCode::Char('n') => {
                            app.selected = None;
                            app.controller.new_conversation().await;
                            app.refresh().await;
                            app.status_message = "New conversation.".to_string();
                        }
                        KeyCode::Char('D') => {
                            app.selected = None;
                            app.controller.clear_all().await;
                            app.refresh().await;
                            app.status_message = "All conversations cleared.".to_string();
                        }
                        KeyCode::Char('j') | KeyCode::Down => app.switch_conversation(1).await,
                        KeyCode::Char('k') | KeyCode::Up => app.switch_conversation(-1).await,
                        KeyCode::PageDown => app.scroll_down(10),
                        KeyCode::PageUp => app.scroll_up(10),
                        _ => {}
                    },
                    InputMode::Editing => match (key.code, key.modifiers) {
                        (KeyCode::Char('s'), KeyModifiers::CONTROL) => app.submit_input().await,
                        (KeyCode::Enter, _) => app.input_buffer.push('\n'),
                        (KeyCode::Char(c), modifier)
                            if modifier == KeyModifiers::NONE || modifier == KeyModifiers::SHIFT =>
                        {
                            app.input_buffer.push(c);
                        }
                        (KeyCode::Backspace, _) => {
                            app.input_buffer.pop();
                        }
                        (KeyCode::Esc, _) => {
                            app.input_mode = InputMode::Normal;
                            if app.editing.take().is_some() {
                                app.input_buffer.clear();
                                app.status_message = "Edit discarded.".to_string();
                            } else {
                                app.status_message = "Input kept. Press 'Enter' to continue typing.".to_string();
                            }
                        }
                        _ => {}
                    },
                },
                _ => {}
            }
        }

        // Drain everything the stream tasks published since the last frame.
        loop {
            match app.event_receiver.try_recv() {
                Ok(display_event) => app.handle_display_event(display_event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    app.status_message = "Critical Error: Display channel disconnected.".to_string();
                    terminal.draw(|f| ui(f, app))?;
                    return Err(AppError::ChannelReceive);
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- UI Drawing Logic ---
fn ui(f: &mut Frame, app: &App) {
    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(25), Constraint::Percentage(75)])
        .split(f.size());

    // --- Left side: Conversations ---
    let items: Vec<ListItem> = app
        .conversations
        .iter()
        .map(|c| ListItem::new(c.title.as_str()))
        .collect();
    let conversation_list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" Chats (j/k, n: new, D: clear) "))
        .highlight_style(Style::default().add_modifier(Modifier::BOLD).bg(Color::Blue))
        .highlight_symbol("> ");
    let mut list_state = ListState::default();
    let current = app.controller.current_conversation();
    list_state.select(app.conversations.iter().position(|c| Some(c.id) == current));
    f.render_stateful_widget(conversation_list, main_chunks[0], &mut list_state);

    // --- Right side: Messages, Input, Status ---
    let right_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(7), Constraint::Length(1)])
        .split(main_chunks[1]);

    let mut content: Vec<Line> = Vec::new();
    for (i, message) in app.messages.iter().enumerate() {
        content.push(bubble_header(message, app.selected == Some(i)));
        match message.role {
            Role::Assistant => content.extend(render_markdown(&message.content)),
            _ => content.extend(message.content.lines().map(|l| Line::raw(l.to_string()))),
        }
        content.push(Line::from(""));
    }

    let messages_paragraph = Paragraph::new(content)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Conversation ([/]: select, e: edit, d: delete, PgUp/PgDn) "),
        )
        .wrap(Wrap { trim: false })
        .scroll((app.scroll_offset, 0));
    f.render_widget(messages_paragraph, right_chunks[0]);

    // --- Input Area ---
    let (input_title, input_style) = match app.input_mode {
        InputMode::Editing => (
            " Input (Enter: Newline, Ctrl+S: Send, Esc: Cancel) ",
            Style::default().fg(Color::Yellow),
        ),
        InputMode::Normal => (" Input (Press Enter to type) ", Style::default()),
    };
    let input_paragraph = Paragraph::new(app.input_buffer.as_str())
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(input_title)
                .border_style(input_style),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(input_paragraph, right_chunks[1]);

    if let InputMode::Editing = app.input_mode {
        let input_area = right_chunks[1];
        let last_line = app.input_buffer.split('\n').last().unwrap_or("");
        let row = app.input_buffer.matches('\n').count() as u16;
        let cursor_x = (input_area.x + 1 + last_line.chars().count() as u16)
            .min(input_area.right().saturating_sub(2));
        let cursor_y = (input_area.y + 1 + row).min(input_area.bottom().saturating_sub(2));
        f.set_cursor(cursor_x, cursor_y);
    }

    // --- Status Bar ---
    let status_style = if app.status_message.to_lowercase().contains("error") {
        Style::default().bg(Color::Red).fg(Color::White)
    } else if app.is_loading() {
        Style::default().bg(Color::Yellow).fg(Color::Black)
    } else {
        Style::default().bg(Color::DarkGray).fg(Color::White)
    };
    let status_bar = Paragraph::new(app.status_message.as_str()).style(status_style);
    f.render_widget(status_bar, right_chunks[2]);
}

fn bubble_header(message: &Message, selected: bool) -> Line<'static> {
    let (name, style) = match message.role {
        Role::User => ("You", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
        Role::Assistant => ("Assistant", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Role::System => ("System", Style::default().fg(Color::DarkGray)),
    };
    let mut label = format!("{name}:");
    if message.is_streaming && message.status != MessageStatus::Error {
        label.push_str(" …");
    }
    if message.status == MessageStatus::Error {
        label.push_str(" (failed)");
    }
    if message.is_edited {
        label.push_str(" (edited)");
    }
    let mut style = if message.status == MessageStatus::Error {
        style.fg(Color::Red)
    } else {
        style
    };
    if selected {
        style = style.add_modifier(Modifier::REVERSED);
    }
    Line::styled(label, style)
}
