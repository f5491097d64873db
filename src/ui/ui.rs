use image::DynamicImage;
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
};
use ratatui_image::{Resize, StatefulImage, picker::Picker, protocol::StatefulProtocol};
use std::collections::HashMap;
use std::sync::Arc;

use komga_tui::reader::page::{PageIdentity, PublicationId};
use komga_tui::reader::scroll::{ContentItem, ScrollContentEngine};
use komga_tui::reader::session::ReaderSession;
use komga_tui::reader::text::TextPositionTracker;
use komga_tui::reader::view_items::{Half, ViewItem};

/// Scroll engine units per terminal row. Cells are about twice as tall as
/// they are wide, so a row spans two width units.
pub const UNITS_PER_ROW: f64 = 2.0;

const STATUS_HEIGHT: u16 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    #[default]
    Loading,
    Ready,
    Failed,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum Mode {
    #[default]
    Paged,
    Webtoon,
    Text,
}

pub enum PageState {
    Loading,
    Ready(Arc<DynamicImage>),
    Failed(String),
}

pub struct App {
    pub state: AppState,
    pub message: String,
    pub title: String,
    pub mode: Mode,
    pub session: ReaderSession,
    pub scroll: ScrollContentEngine,
    pub text: Option<TextPositionTracker>,
    pub offline: bool,
    pub incognito: bool,
    pub picker: Option<Picker>,
    pages: HashMap<PageIdentity, PageState>,
    protocols: HashMap<(PageIdentity, Option<Half>), StatefulProtocol>,
}

impl App {
    pub fn new(session: ReaderSession, scroll: ScrollContentEngine, mode: Mode) -> Self {
        let picker = Picker::from_query_stdio().ok();

        Self {
            state: AppState::Loading,
            message: "Initializing...".to_string(),
            title: String::new(),
            mode,
            session,
            scroll,
            text: None,
            offline: false,
            incognito: false,
            picker,
            pages: HashMap::new(),
            protocols: HashMap::new(),
        }
    }

    pub fn set_loading(&mut self, message: &str) {
        self.state = AppState::Loading;
        self.message = message.to_string();
    }

    pub fn set_ready(&mut self) {
        self.state = AppState::Ready;
        self.message.clear();
    }

    pub fn set_failed(&mut self, message: String) {
        self.state = AppState::Failed;
        self.message = message;
    }

    /// True when nothing is known about `id` yet, so a fetch should start.
    pub fn needs_page(&self, id: &PageIdentity) -> bool {
        !self.pages.contains_key(id)
    }

    pub fn page_loading(&mut self, id: &PageIdentity) {
        self.pages.insert(id.clone(), PageState::Loading);
    }

    pub fn add_page_image(&mut self, id: PageIdentity, image: Arc<DynamicImage>) {
        self.protocols.retain(|(page, _), _| page != &id);
        self.pages.insert(id, PageState::Ready(image));
    }

    pub fn page_failed(&mut self, id: PageIdentity, reason: String) {
        self.pages.insert(id, PageState::Failed(reason));
    }

    pub fn forget_page(&mut self, id: &PageIdentity) {
        self.pages.remove(id);
    }

    /// Forgets failed pages so the next request fetches them again.
    pub fn reset_failed_pages(&mut self) -> usize {
        let before = self.pages.len();
        self.pages.retain(|_, state| !matches!(state, PageState::Failed(_)));
        before - self.pages.len()
    }

    /// Drops decoded images and terminal protocols for pages `keep` rejects.
    pub fn retain_pages(&mut self, keep: impl Fn(&PageIdentity) -> bool) {
        self.pages.retain(|id, state| keep(id) || matches!(state, PageState::Loading));
        self.protocols.retain(|(id, _), _| keep(id));
    }

    fn protocol_for(&mut self, id: &PageIdentity, half: Option<Half>) -> Option<&mut StatefulProtocol> {
        let key = (id.clone(), half);
        if !self.protocols.contains_key(&key) {
            let picker = self.picker.as_ref()?;
            let Some(PageState::Ready(image)) = self.pages.get(id) else {
                return None;
            };
            let image = match half {
                None => image.as_ref().clone(),
                Some(half) => crop_half(image, half),
            };
            self.protocols.insert(key.clone(), picker.new_resize_protocol(image));
        }
        self.protocols.get_mut(&key)
    }
}

/// Left half first: pages are read left to right.
fn crop_half(image: &DynamicImage, half: Half) -> DynamicImage {
    let width = image.width() / 2;
    let x = match half {
        Half::First => 0,
        Half::Second => width,
    };
    image.crop_imm(x, 0, width.max(1), image.height())
}

/// Size of the page area for a terminal of `width` x `height` cells.
pub fn content_size(width: u16, height: u16) -> (u16, u16) {
    (width, height.saturating_sub(STATUS_HEIGHT))
}

pub fn ui(f: &mut Frame, app: &mut App) {
    match app.state {
        AppState::Loading => draw_loading_screen(f, app),
        AppState::Failed => draw_failure(f, app),
        AppState::Ready => draw_reader(f, app),
    }
}

fn draw_loading_screen(f: &mut Frame, app: &App) {
    let area = f.area();

    let block = Block::default()
        .borders(Borders::ALL)
        .title("Komga Reader")
        .border_style(Style::default().fg(Color::Cyan));

    let inner = block.inner(area);
    f.render_widget(block, area);

    let center_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage(40),
            Constraint::Length(3),
            Constraint::Length(2),
            Constraint::Percentage(40),
        ])
        .split(inner);

    let spinner_frames = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let spinner = spinner_frames[(millis / 100) as usize % spinner_frames.len()];

    let loading_text = Line::from(vec![
        Span::styled(
            format!(" {} ", spinner),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            "Loading...",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
    ]);

    let loading_paragraph = Paragraph::new(loading_text).alignment(Alignment::Center);
    f.render_widget(loading_paragraph, center_layout[1]);

    let message = Paragraph::new(&*app.message)
        .style(Style::default().fg(Color::DarkGray))
        .alignment(Alignment::Center);
    f.render_widget(message, center_layout[2]);
}

fn draw_failure(f: &mut Frame, app: &App) {
    let area = f.area();
    let block = Block::default()
        .borders(Borders::ALL)
        .title("Komga Reader")
        .border_style(Style::default().fg(Color::Red));

    let lines = vec![
        Line::from(""),
        Line::from(Span::styled(
            app.message.as_str(),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(Span::styled("r: retry  q: quit", Style::default().fg(Color::DarkGray))),
    ];
    let paragraph = Paragraph::new(lines).block(block).alignment(Alignment::Center);
    f.render_widget(paragraph, area);
}

fn draw_reader(f: &mut Frame, app: &mut App) {
    let area = f.area();

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(3), Constraint::Length(STATUS_HEIGHT)])
        .split(area);

    match app.mode {
        Mode::Paged => draw_view_item(f, root[0], app),
        Mode::Webtoon => draw_strip(f, root[0], app),
        Mode::Text => draw_text_position(f, root[0], app),
    }

    draw_status_bar(f, root[1], app);
}

fn draw_view_item(f: &mut Frame, area: Rect, app: &mut App) {
    match app.session.current_view_item().cloned() {
        Some(ViewItem::Page(id)) => draw_page(f, area, app, &id, None),
        Some(ViewItem::SplitHalf(id, half)) => draw_page(f, area, app, &id, Some(half)),
        Some(ViewItem::DualPair(left, right)) => {
            let columns = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                .split(area);
            draw_page(f, columns[0], app, &left, None);
            draw_page(f, columns[1], app, &right, None);
        }
        Some(ViewItem::End(publication)) => draw_end_marker(f, area, app, &publication),
        None => {
            let empty = Paragraph::new("No pages")
                .alignment(Alignment::Center)
                .style(Style::default().fg(Color::DarkGray));
            f.render_widget(empty, area);
        }
    }
}

fn draw_page(f: &mut Frame, area: Rect, app: &mut App, id: &PageIdentity, half: Option<Half>) {
    if area.height == 0 || area.width == 0 {
        return;
    }
    if let Some(state) = app.protocol_for(id, half) {
        let image_widget = StatefulImage::new().resize(Resize::Scale(None));
        f.render_stateful_widget(image_widget, area, state);
        return;
    }

    let (text, color) = match app.pages.get(id) {
        Some(PageState::Failed(reason)) => (format!("Page {} failed: {}  (r: retry)", id.number, reason), Color::Red),
        Some(PageState::Ready(_)) => (format!("Page {} (no image protocol)", id.number), Color::DarkGray),
        _ => (format!("Loading page {}...", id.number), Color::DarkGray),
    };
    let placeholder = Paragraph::new(vec![Line::from(""), Line::from(Span::styled(text, Style::default().fg(color)))])
        .alignment(Alignment::Center);
    f.render_widget(placeholder, area);
}

fn draw_end_marker(f: &mut Frame, area: Rect, app: &App, publication: &PublicationId) {
    let segment = app.session.store().segment_for_publication(publication);
    let title = segment.map_or(publication.as_str(), |s| s.publication.title.as_str());
    let next = segment
        .and_then(|s| s.next.as_ref())
        .map(|p| format!("Next: {}", p.title))
        .unwrap_or_else(|| "No next book".to_string());

    let lines = vec![
        Line::from(""),
        Line::from(Span::styled(
            format!("End of {}", title),
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )),
        Line::from(Span::styled(next, Style::default().fg(Color::DarkGray))),
    ];
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));
    f.render_widget(Paragraph::new(lines).block(block).alignment(Alignment::Center), area);
}

/// Draws the items of the continuous strip that intersect the viewport.
fn draw_strip(f: &mut Frame, area: Rect, app: &mut App) {
    let scroll_top = app.scroll.scroll_top();
    let visible: Vec<(usize, ContentItem)> = app
        .scroll
        .visible_range()
        .filter_map(|i| app.scroll.items().get(i).cloned().map(|item| (i, item)))
        .collect();

    for (index, item) in visible {
        let (Some(top), Some(height)) = (app.scroll.item_top(index), app.scroll.item_height(index)) else {
            continue;
        };
        let first_row = ((top - scroll_top) / UNITS_PER_ROW).floor();
        let last_row = ((top + height - scroll_top) / UNITS_PER_ROW).ceil();
        let y0 = first_row.max(0.0) as u16;
        let y1 = (last_row.max(0.0) as u16).min(area.height);
        if y1 <= y0 {
            continue;
        }
        let rect = Rect::new(area.x, area.y + y0, area.width, y1 - y0);
        match item {
            ContentItem::Page(id) => draw_page(f, rect, app, &id, None),
            ContentItem::End(publication) => draw_end_marker(f, rect, app, &publication),
        }
    }
}

fn draw_text_position(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let lines = match app.text.as_ref().and_then(TextPositionTracker::location) {
        Some(location) => vec![
            Line::from(""),
            Line::from(Span::styled(
                location.title.unwrap_or(location.href),
                Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
            )),
            Line::from(format!(
                "Chapter {}  page {} of {}",
                location.chapter_index + 1,
                location.page_index + 1,
                location.page_count
            )),
        ],
        None => vec![Line::from(""), Line::from("Loading contents...")],
    };
    f.render_widget(Paragraph::new(lines).block(block).alignment(Alignment::Center), area);
}

fn draw_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let key = Style::default().fg(Color::Yellow);
    let mut spans = Vec::new();

    let title = app
        .session
        .current_publication()
        .map_or(app.title.as_str(), |p| p.title.as_str());
    spans.push(Span::styled(
        title.to_string(),
        Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
    ));

    let progression = match (app.mode, app.text.as_ref()) {
        (Mode::Text, Some(text)) => Some(text.progression()),
        (Mode::Text, None) => None,
        _ => app.session.progression(),
    };
    if app.mode != Mode::Text {
        if let Some((page, count)) = page_position(&app.session) {
            spans.push(Span::raw(format!("  {}/{}", page, count)));
        }
    }
    if let Some(progression) = progression {
        spans.push(Span::styled(
            format!("  ch {:.0}% · book {:.0}%", progression.chapter * 100.0, progression.total * 100.0),
            Style::default().fg(Color::Cyan),
        ));
    }

    let layout = match app.mode {
        Mode::Webtoon => "webtoon",
        Mode::Text => "text",
        Mode::Paged if app.session.dual_page_active() => "dual",
        Mode::Paged => "single",
    };
    spans.push(Span::styled(format!("  [{}]", layout), Style::default().fg(Color::DarkGray)));
    if app.offline {
        spans.push(Span::styled("  [offline]", Style::default().fg(Color::Red)));
    }
    if app.incognito {
        spans.push(Span::styled("  [incognito]", Style::default().fg(Color::Magenta)));
    }
    if !app.message.is_empty() {
        spans.push(Span::styled(format!("  {}", app.message), Style::default().fg(Color::DarkGray)));
    }

    spans.extend([
        Span::raw("   "),
        Span::styled("←/→", key),
        Span::raw(": page  "),
        Span::styled("d", key),
        Span::raw(": dual  "),
        Span::styled("w", key),
        Span::raw(": webtoon  "),
        Span::styled("i", key),
        Span::raw(": isolate  "),
        Span::styled("q", key),
        Span::raw(": quit"),
    ]);

    let p = Paragraph::new(Line::from(spans))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .alignment(Alignment::Center);
    f.render_widget(p, area);
}

/// One-based page number inside the current publication and its page count.
fn page_position(session: &ReaderSession) -> Option<(usize, usize)> {
    let page = session.current_page()?;
    let global = session.current_global_index()?;
    let range = session.store().page_range_of(&page.publication)?;
    Some((global - range.start + 1, range.len()))
}
