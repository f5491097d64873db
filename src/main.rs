mod ui;

use komga_tui::backend::cache::PageCache;
use komga_tui::backend::komga::KomgaClient;
use komga_tui::backend::offline::{DiskDownloads, wait_until_ready};
use komga_tui::backend::store::LocalStore;
use komga_tui::backend::{PageSource, Sibling};
use komga_tui::config::{self, OfflineFlag, PageLayout, ReaderConfig};
use komga_tui::error::{ReaderError, Result as ReaderResult};
use komga_tui::reader::image_cache::{CachedImage, ImageFetchCache};
use komga_tui::reader::page::{MediaProfile, PageIdentity, Publication, PublicationId, ReaderPage, Segment};
use komga_tui::reader::progress::{ProgressDispatchGate, ProgressUpdate, ProgressionLocator};
use komga_tui::reader::scroll::{ContentItem, InitialScrollRetrier, RetryTicket, ScrollAttempt, ScrollContentEngine};
use komga_tui::reader::segments::SegmentStore;
use komga_tui::reader::session::{ReaderSession, fetch_segment};
use komga_tui::reader::text::{Manifest, TextPositionTracker, normalized_href, text_length};
use komga_tui::reader::view_items::ViewItem;
use ui::ui::{App, AppState, Mode, UNITS_PER_ROW, content_size, ui};

use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEventKind},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures::StreamExt;
use log::{debug, info, warn};
use ratatui::{Terminal, backend::CrosstermBackend};
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::time::Duration;
use std::{error::Error, io};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Height of a book's end marker in the continuous strip, in scroll units.
const END_MARKER_HEIGHT: f64 = 12.0;
const OFFLINE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const OFFLINE_MAX_POLLS: u32 = 10;
const TEXT_LAYOUT_SIGNATURE: &str = "terminal";
const TEXT_END_PROGRESSION: f64 = 1.0;
/// Items around the visible part of the strip whose images are fetched ahead.
const PREHEAT_RADIUS: usize = 2;
const SCROLL_STEP_ROWS: f64 = 3.0;

enum BackgroundTask {
    ImagesOpened { segment: Segment, start_page: Option<u32> },
    TextOpened { publication: Publication, manifest: Manifest, saved: Option<ProgressionLocator> },
    OpenFailed { message: String },
    SiblingLoaded { which: Sibling, segment: Segment },
    SiblingFailed { publication: PublicationId },
    PageLoaded { id: PageIdentity, result: ReaderResult<CachedImage> },
    TextLengthLoaded { chapter: usize, key: String, length: u64 },
    InitialScrollRetry(RetryTicket),
}

/// Work for the progress worker. Commands run one at a time, in order.
enum ProgressCommand {
    Switch(PublicationId),
    Page(ProgressUpdate),
    EndOfBook(ProgressUpdate),
    Incognito(bool),
    DrainQueue,
}

/// Collaborators and bookkeeping the event loop needs next to the `App`.
struct Reader {
    config: ReaderConfig,
    client: Arc<KomgaClient>,
    store: Arc<LocalStore>,
    disk: PageCache,
    images: ImageFetchCache,
    offline: OfflineFlag,
    publication: PublicationId,
    start_page: Option<u32>,
    tx: mpsc::UnboundedSender<BackgroundTask>,
    progress: mpsc::UnboundedSender<ProgressCommand>,
    reporting: Option<PublicationId>,
    siblings_requested: HashSet<PublicationId>,
    viewport: (u16, u16),
}

impl Reader {
    fn send_progress(&self, command: ProgressCommand) {
        if self.progress.send(command).is_err() {
            warn!("progress worker has stopped");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let Some(book) = args.next() else {
        eprintln!("usage: komga-tui <book-id> [page]");
        return Ok(());
    };
    let start_page = args.next().and_then(|page| page.parse::<u32>().ok());

    init_logging()?;
    let config = ReaderConfig::load();
    info!("opening {} from {}", book, config.server_url);

    let offline = OfflineFlag::new(config.offline);
    let client = Arc::new(KomgaClient::from_config(&config)?);
    let store = Arc::new(LocalStore::in_default_location());
    let disk = PageCache::in_default_location(config.max_disk_cache_mb);
    let images = ImageFetchCache::new(client.clone(), disk.clone(), offline.clone());
    let (wake_tx, wake_rx) = mpsc::unbounded_channel();
    let gate = ProgressDispatchGate::new(client.clone(), config.progress_interval(), offline.clone())
        .with_queue(store.clone())
        .with_trailing_wake(wake_tx);
    gate.set_incognito(config.incognito);
    let (progress_tx, progress_worker) = spawn_progress_worker(gate, wake_rx);

    let session = ReaderSession::new(config.layout_policy(), config.page_layout == PageLayout::Dual)
        .with_keep_window(config.keep_before, config.keep_after)
        .with_isolated(store.isolate_pages());
    let scroll = ScrollContentEngine::new(
        END_MARKER_HEIGHT,
        InitialScrollRetrier::new(config.initial_scroll_max_retries, config.initial_scroll_delay()),
    );
    let mode = if config.webtoon { Mode::Webtoon } else { Mode::Paged };

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(session, scroll, mode);
    app.offline = offline.is_offline();
    app.incognito = config.incognito;

    // Create channel for background tasks
    let (task_tx, mut task_rx) = mpsc::unbounded_channel::<BackgroundTask>();

    let (width, height) = crossterm::terminal::size()?;
    let mut reader = Reader {
        config,
        client,
        store,
        disk,
        images,
        offline,
        publication: PublicationId::new(book),
        start_page,
        tx: task_tx,
        progress: progress_tx,
        reporting: None,
        siblings_requested: HashSet::new(),
        viewport: content_size(width, height),
    };
    apply_viewport(&mut app, &mut reader, content_size(width, height));

    if !reader.offline.is_offline() {
        reader.send_progress(ProgressCommand::DrainQueue);
    }
    app.set_loading("Opening publication...");
    spawn_open(&reader);

    let res = run_app(&mut terminal, &mut app, &mut reader, &mut task_rx).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    // Closing the command channel makes the worker flush and exit.
    drop(reader);
    if let Err(e) = progress_worker.await {
        warn!("progress worker failed: {}", e);
    }

    if let Err(err) = res {
        eprintln!("{err}");
    }
    Ok(())
}

/// Logs go to a file: the terminal is in raw mode on the alternate screen.
fn init_logging() -> Result<(), Box<dyn Error>> {
    let dir = config::cache_dir();
    std::fs::create_dir_all(&dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("komga-tui.log"))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

fn spawn_progress_worker(
    gate: ProgressDispatchGate,
    mut wake: mpsc::UnboundedReceiver<u64>,
) -> (mpsc::UnboundedSender<ProgressCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressCommand>();
    let handle = tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                Some(generation) = wake.recv() => {
                    let dispatch = gate.send_trailing(generation).await;
                    debug!("trailing progress: {:?}", dispatch);
                    continue;
                }
            };
            match command {
                ProgressCommand::Switch(id) => {
                    if gate.publication() != id {
                        let dispatch = gate.flush().await;
                        debug!("flushed {} before switching: {:?}", gate.publication(), dispatch);
                        gate.set_publication(id);
                    }
                }
                ProgressCommand::Page(update) => {
                    let dispatch = gate.page_changed(update).await;
                    debug!("page progress: {:?}", dispatch);
                }
                ProgressCommand::EndOfBook(update) => {
                    let dispatch = gate.end_of_book(update).await;
                    debug!("end of book progress: {:?}", dispatch);
                }
                ProgressCommand::Incognito(incognito) => gate.set_incognito(incognito),
                ProgressCommand::DrainQueue => {
                    gate.drain_offline_queue().await;
                }
            }
        }
        let dispatch = gate.flush().await;
        debug!("final progress flush: {:?}", dispatch);
    });
    (tx, handle)
}

fn spawn_open(reader: &Reader) {
    let client = reader.client.clone();
    let store = reader.store.clone();
    let disk = reader.disk.clone();
    let offline = reader.offline.clone();
    let id = reader.publication.clone();
    let start_page = reader.start_page;
    let tx = reader.tx.clone();

    tokio::spawn(async move {
        let task = match open_publication(&client, &store, &disk, &offline, &id, start_page).await {
            Ok(task) => task,
            Err(e) => {
                warn!("failed to open {}: {}", id, e);
                BackgroundTask::OpenFailed { message: e.to_string() }
            }
        };
        let _ = tx.send(task);
    });
}

async fn open_publication(
    client: &KomgaClient,
    store: &Arc<LocalStore>,
    disk: &PageCache,
    offline: &OfflineFlag,
    id: &PublicationId,
    start_page: Option<u32>,
) -> ReaderResult<BackgroundTask> {
    let publication = if offline.is_offline() {
        store
            .read_publication(id)
            .ok_or_else(|| ReaderError::Offline(format!("{id} is not downloaded")))?
    } else {
        let publication = client.fetch_publication(id).await?;
        if let Err(e) = store.write_publication(&publication) {
            warn!("failed to store {}: {}", id, e);
        }
        publication
    };

    if publication.media_profile == MediaProfile::Epub {
        let manifest = load_manifest(client, store, offline, id).await?;
        let saved = if offline.is_offline() {
            None
        } else {
            client.fetch_progression(id).await.unwrap_or_else(|e| {
                warn!("failed to read saved position of {}: {}", id, e);
                None
            })
        };
        return Ok(BackgroundTask::TextOpened {
            publication,
            manifest,
            saved,
        });
    }

    if offline.is_offline() {
        let downloads = DiskDownloads::new(Arc::clone(store), disk.clone());
        wait_until_ready(&downloads, id, OFFLINE_POLL_INTERVAL, OFFLINE_MAX_POLLS).await?;
    }
    let segment = fetch_segment(client, store, offline, publication).await?;
    Ok(BackgroundTask::ImagesOpened { segment, start_page })
}

async fn load_manifest(
    client: &KomgaClient,
    store: &LocalStore,
    offline: &OfflineFlag,
    id: &PublicationId,
) -> ReaderResult<Manifest> {
    if let Some(manifest) = store.read_manifest(id) {
        return Ok(manifest);
    }
    if offline.is_offline() {
        return Err(ReaderError::Offline(format!("contents of {id} are not downloaded")));
    }
    let manifest = client.fetch_manifest(id).await?;
    if let Err(e) = store
        .write_manifest(id, &manifest)
        .and_then(|()| store.write_toc(id, &manifest.toc))
    {
        warn!("failed to store contents of {}: {}", id, e);
    }
    Ok(manifest)
}

fn spawn_page_loader(images: ImageFetchCache, page: ReaderPage, tx: mpsc::UnboundedSender<BackgroundTask>) {
    tokio::spawn(async move {
        let result = images.try_get_or_fetch(&page).await;
        let _ = tx.send(BackgroundTask::PageLoaded { id: page.id, result });
    });
}

fn spawn_text_length_loader(reader: &Reader, chapter: usize, key: String, href: String) {
    let client = reader.client.clone();
    let id = reader.publication.clone();
    let tx = reader.tx.clone();

    tokio::spawn(async move {
        match client.fetch_resource(&id, &href).await {
            Ok(markup) => {
                let length = text_length(&markup);
                let _ = tx.send(BackgroundTask::TextLengthLoaded { chapter, key, length });
            }
            Err(e) => debug!("no text length for {}: {}", href, e),
        }
    });
}

fn spawn_scroll_retry(delay: Duration, ticket: RetryTicket, tx: mpsc::UnboundedSender<BackgroundTask>) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(BackgroundTask::InitialScrollRetry(ticket));
    });
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    reader: &mut Reader,
    task_rx: &mut mpsc::UnboundedReceiver<BackgroundTask>,
) -> io::Result<()> {
    let mut event_stream = EventStream::new();

    loop {
        terminal.draw(|f| ui(f, app))?;

        tokio::select! {
            // Redraw tick for the loading spinner
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}

            Some(Ok(event)) = event_stream.next() => {
                match event {
                    Event::Key(key) if key.kind == KeyEventKind::Press => {
                        if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                            return Ok(());
                        }
                        handle_input(app, reader, key.code).await;
                    }
                    Event::Resize(width, height) => {
                        apply_viewport(app, reader, content_size(width, height));
                        if app.mode == Mode::Webtoon {
                            follow_scroll(app);
                        }
                        request_pages(app, reader).await;
                    }
                    _ => {}
                }
            }

            Some(task) = task_rx.recv() => handle_task(app, reader, task).await,
        }
    }
}

async fn handle_task(app: &mut App, reader: &mut Reader, task: BackgroundTask) {
    match task {
        BackgroundTask::ImagesOpened { segment, start_page } => {
            app.title = segment.publication.title.clone();
            app.session.load_publication(segment, start_page);
            app.set_ready();
            if app.mode == Mode::Webtoon {
                enter_webtoon(app, reader);
            }
            position_changed(app, reader).await;
        }
        BackgroundTask::TextOpened {
            publication,
            manifest,
            saved,
        } => {
            let mut tracker = TextPositionTracker::new(publication.id.clone(), &manifest);
            let lengths = reader.store.text_lengths();
            tracker.refresh_text_weights(|href| lengths.get(href).copied());
            if let Some(saved) = &saved {
                tracker.restore(saved);
            }
            for (chapter, key) in tracker.missing_text_weights() {
                if let Some(href) = tracker.chapter_href(chapter) {
                    spawn_text_length_loader(reader, chapter, key, href.to_string());
                }
            }

            reader.reporting = Some(publication.id.clone());
            reader.send_progress(ProgressCommand::Switch(publication.id));
            app.title = publication.title;
            app.mode = Mode::Text;
            app.text = Some(tracker);
            layout_text(app, reader);
            app.set_ready();
        }
        BackgroundTask::OpenFailed { message } => app.set_failed(message),
        BackgroundTask::SiblingLoaded { which, segment } => {
            let id = segment.id().clone();
            let added = match which {
                Sibling::Next => app.session.append_sibling(segment),
                Sibling::Previous => app.session.prepend_sibling(segment),
            };
            debug!("{:?} sibling {} joined: {}", which, id, added);
            if added && app.mode == Mode::Webtoon {
                app.scroll.sync(app.session.store());
            }
        }
        BackgroundTask::SiblingFailed { publication } => {
            reader.siblings_requested.remove(&publication);
        }
        BackgroundTask::PageLoaded { id, result } => match result {
            Ok(image) => {
                if image.is_animated {
                    debug!("{} is animated, showing its first frame", id);
                }
                app.add_page_image(id, image.image);
            }
            Err(ReaderError::Cancelled) => app.forget_page(&id),
            Err(e) => app.page_failed(id, e.to_string()),
        },
        BackgroundTask::TextLengthLoaded { chapter, key, length } => {
            if let Err(e) = reader.store.save_text_length(&key, length) {
                warn!("failed to store text length of {}: {}", key, e);
            }
            if let Some(tracker) = app.text.as_mut() {
                tracker.set_text_weight(chapter, length);
                paginate_chapter(tracker, &reader.store, chapter, length, reader.viewport);
            }
        }
        BackgroundTask::InitialScrollRetry(ticket) => {
            let attempt = app.scroll.retry(ticket);
            handle_scroll_attempt(app, reader, attempt);
            if attempt == ScrollAttempt::Done {
                follow_scroll(app);
                request_pages(app, reader).await;
            }
        }
    }
}

async fn handle_input(app: &mut App, reader: &mut Reader, key: KeyCode) {
    match app.state {
        AppState::Failed => {
            if key == KeyCode::Char('r') {
                app.set_loading("Opening publication...");
                spawn_open(reader);
            }
            return;
        }
        AppState::Loading => return,
        AppState::Ready => {}
    }

    match key {
        KeyCode::Char('o') => {
            let offline = !reader.offline.is_offline();
            reader.offline.set(offline);
            app.offline = offline;
            info!("offline mode {}", if offline { "on" } else { "off" });
            if !offline {
                reader.send_progress(ProgressCommand::DrainQueue);
            }
            return;
        }
        KeyCode::Char('n') => {
            app.incognito = !app.incognito;
            reader.send_progress(ProgressCommand::Incognito(app.incognito));
            return;
        }
        _ => {}
    }

    match app.mode {
        Mode::Paged => handle_paged_input(app, reader, key).await,
        Mode::Webtoon => handle_webtoon_input(app, reader, key).await,
        Mode::Text => handle_text_input(app, reader, key),
    }
}

async fn handle_paged_input(app: &mut App, reader: &mut Reader, key: KeyCode) {
    let changed = match key {
        KeyCode::Right | KeyCode::Char('l') | KeyCode::Char(' ') => app.session.next_view_item(),
        KeyCode::Left | KeyCode::Char('h') => app.session.previous_view_item(),
        KeyCode::Home => {
            app.session.navigate_to_view_item(0);
            true
        }
        KeyCode::Char('d') => {
            let active = !app.session.dual_page_active();
            app.session.set_dual_page_active(active);
            true
        }
        KeyCode::Char('i') => toggle_isolate(app, reader),
        KeyCode::Char('w') => {
            enter_webtoon(app, reader);
            true
        }
        KeyCode::Char('r') => app.reset_failed_pages() > 0,
        _ => false,
    };
    if changed {
        position_changed(app, reader).await;
    }
}

async fn handle_webtoon_input(app: &mut App, reader: &mut Reader, key: KeyCode) {
    let screen = reader.viewport.1 as f64 * UNITS_PER_ROW * 0.9;
    let step = SCROLL_STEP_ROWS * UNITS_PER_ROW;
    match key {
        KeyCode::Down | KeyCode::Char('j') => app.scroll.scroll_by(step),
        KeyCode::Up | KeyCode::Char('k') => app.scroll.scroll_by(-step),
        KeyCode::PageDown | KeyCode::Right | KeyCode::Char(' ') => app.scroll.scroll_by(screen),
        KeyCode::PageUp | KeyCode::Left => app.scroll.scroll_by(-screen),
        KeyCode::Char('w') => {
            app.scroll.cancel_initial_scroll();
            app.mode = Mode::Paged;
            position_changed(app, reader).await;
            return;
        }
        KeyCode::Char('r') => {
            if app.reset_failed_pages() > 0 {
                request_pages(app, reader).await;
            }
            return;
        }
        _ => return,
    }
    app.scroll.cancel_initial_scroll();
    follow_scroll(app);
    position_changed(app, reader).await;
}

fn handle_text_input(app: &mut App, reader: &Reader, key: KeyCode) {
    let Some(tracker) = app.text.as_mut() else {
        return;
    };
    let command = match key {
        KeyCode::Right | KeyCode::Char('l') | KeyCode::Char(' ') => {
            if tracker.next_page() {
                tracker.current_locator().map(|l| ProgressCommand::Page(ProgressUpdate::Locator(l)))
            } else {
                tracker
                    .end_of_book_locator(TEXT_END_PROGRESSION)
                    .map(|l| ProgressCommand::EndOfBook(ProgressUpdate::Locator(l)))
            }
        }
        KeyCode::Left | KeyCode::Char('h') => {
            tracker.previous_page();
            tracker.current_locator().map(|l| ProgressCommand::Page(ProgressUpdate::Locator(l)))
        }
        _ => None,
    };
    if let Some(command) = command {
        reader.send_progress(command);
    }
}

fn toggle_isolate(app: &mut App, reader: &Reader) -> bool {
    let Some(page) = app.session.current_page().cloned() else {
        return false;
    };
    let Some(isolated) = app.session.toggle_isolate(&page) else {
        return false;
    };
    app.message = if isolated {
        format!("page {} shown alone", page.number)
    } else {
        format!("page {} paired again", page.number)
    };
    if let Err(e) = reader.store.save_isolate_pages(app.session.isolated()) {
        warn!("failed to store isolated pages: {}", e);
    }
    true
}

fn apply_viewport(app: &mut App, reader: &mut Reader, viewport: (u16, u16)) {
    reader.viewport = viewport;
    let (width, height) = viewport;
    if reader.config.page_layout == PageLayout::Auto {
        app.session
            .set_dual_page_active(width as f64 > height as f64 * UNITS_PER_ROW);
    }
    app.scroll
        .set_viewport(width as f64, height as f64 * UNITS_PER_ROW);
    match app.mode {
        Mode::Webtoon => {
            app.scroll.sync(app.session.store());
        }
        Mode::Text => layout_text(app, reader),
        Mode::Paged => {}
    }
}

fn enter_webtoon(app: &mut App, reader: &Reader) {
    app.mode = Mode::Webtoon;
    app.scroll.sync(app.session.store());
    if let Some(page) = app.session.current_page().cloned() {
        let attempt = app.scroll.attach(page);
        handle_scroll_attempt(app, reader, attempt);
    }
}

fn handle_scroll_attempt(app: &mut App, reader: &Reader, attempt: ScrollAttempt) {
    match attempt {
        ScrollAttempt::Retry(ticket) => spawn_scroll_retry(app.scroll.retry_delay(), ticket, reader.tx.clone()),
        ScrollAttempt::GaveUp => app.message = "could not restore the scroll position".to_string(),
        ScrollAttempt::Done | ScrollAttempt::Stale => {}
    }
}

/// Moves the session to the item the strip currently shows.
fn follow_scroll(app: &mut App) {
    let Some(index) = app.scroll.current_item_index() else {
        return;
    };
    match app.scroll.items().get(index).cloned() {
        Some(ContentItem::Page(id)) => {
            app.session.navigate_to_page(&id);
        }
        Some(ContentItem::End(publication)) => {
            let end = app
                .session
                .items()
                .iter()
                .position(|item| matches!(item, ViewItem::End(p) if *p == publication));
            if let Some(end) = end {
                app.session.navigate_to_view_item(end);
            }
        }
        None => {}
    }
}

async fn position_changed(app: &mut App, reader: &mut Reader) {
    report_progress(app, reader);
    request_pages(app, reader).await;
    prefetch_sibling(app, reader);
}

fn report_progress(app: &App, reader: &mut Reader) {
    let Some(publication) = app.session.current_publication().map(|p| p.id.clone()) else {
        return;
    };
    if reader.reporting.as_ref() != Some(&publication) {
        reader.reporting = Some(publication.clone());
        reader.send_progress(ProgressCommand::Switch(publication));
    }

    let command = if app.session.is_at_end() {
        app.session
            .end_of_book_update()
            .map(|(_, update)| ProgressCommand::EndOfBook(update))
    } else {
        app.session
            .page_progress_update()
            .map(|(_, update)| ProgressCommand::Page(update))
    };
    if let Some(command) = command {
        reader.send_progress(command);
    }
}

fn reader_page(store: &SegmentStore, id: &PageIdentity) -> Option<ReaderPage> {
    store.global_index_of(id).and_then(|g| store.page_at(g)).cloned()
}

/// Fetches what is on screen, drops what left the keep window and warms the
/// image cache around the current page.
async fn request_pages(app: &mut App, reader: &mut Reader) {
    let store = app.session.store();
    let wanted: Vec<ReaderPage> = match app.mode {
        Mode::Paged => app
            .session
            .current_view_item()
            .map(|item| item.pages().into_iter().filter_map(|id| reader_page(store, id)).collect())
            .unwrap_or_default(),
        Mode::Webtoon => app
            .scroll
            .preheat_pages(PREHEAT_RADIUS)
            .iter()
            .filter_map(|id| reader_page(store, id))
            .collect(),
        Mode::Text => return,
    };
    // Evict first: the cache only admits finished loads inside the latest window.
    if let Some(window) = app.session.keep_window() {
        let evicted = reader
            .images
            .evict_outside_window(window.current, window.before, window.after, app.session.store())
            .await;
        if evicted > 0 {
            let keep: HashSet<PageIdentity> = app
                .session
                .store()
                .reader_pages()
                .iter()
                .enumerate()
                .filter(|(global, _)| window.contains(*global))
                .map(|(_, page)| page.id.clone())
                .collect();
            app.retain_pages(|id| keep.contains(id));
        }
    }

    for page in wanted {
        if app.needs_page(&page.id) {
            app.page_loading(&page.id);
            spawn_page_loader(reader.images.clone(), page, reader.tx.clone());
        }
    }

    let neighbours = app
        .session
        .preload_pages(reader.config.preload_before, reader.config.preload_after);
    let images = reader.images.clone();
    tokio::spawn(async move {
        images.preload(&neighbours).await;
    });
}

fn prefetch_sibling(app: &App, reader: &mut Reader) {
    let Some((which, publication)) = app.session.sibling_to_prefetch() else {
        return;
    };
    if !reader.siblings_requested.insert(publication.id.clone()) {
        return;
    }
    let client = reader.client.clone();
    let store = reader.store.clone();
    let offline = reader.offline.clone();
    let tx = reader.tx.clone();

    tokio::spawn(async move {
        let id = publication.id.clone();
        let task = match fetch_segment(client.as_ref(), &store, &offline, publication).await {
            Ok(segment) => BackgroundTask::SiblingLoaded { which, segment },
            Err(e) => {
                warn!("failed to load {:?} sibling {}: {}", which, id, e);
                BackgroundTask::SiblingFailed { publication: id }
            }
        };
        let _ = tx.send(task);
    });
}

/// Applies cached page counts for the current viewport and estimates the
/// rest from known text lengths.
fn layout_text(app: &mut App, reader: &Reader) {
    let Some(tracker) = app.text.as_mut() else {
        return;
    };
    let (width, height) = reader.viewport;
    let counts = reader.store.page_counts();
    tracker.set_layout(width as u32, height as u32, TEXT_LAYOUT_SIGNATURE, |key| {
        counts.get(&key.to_string()).copied()
    });

    let lengths = reader.store.text_lengths();
    for chapter in 0..tracker.chapter_count() {
        let cached = tracker
            .page_count_key(chapter)
            .and_then(|key| counts.get(&key.to_string()).copied());
        match cached {
            // Unchanged counts still resolve a restored position.
            Some(count) => {
                tracker.update_chapter_page_count(chapter, count);
            }
            None => {
                let length = tracker
                    .chapter_href(chapter)
                    .and_then(|href| lengths.get(&normalized_href(href)).copied());
                if let Some(length) = length {
                    paginate_chapter(tracker, &reader.store, chapter, length, reader.viewport);
                }
            }
        }
    }
}

/// Screens needed for `length` characters when every cell holds one.
fn paginate_chapter(
    tracker: &mut TextPositionTracker,
    store: &LocalStore,
    chapter: usize,
    length: u64,
    (width, height): (u16, u16),
) {
    let per_screen = (width as u64 * height as u64).max(1);
    let count = length.div_ceil(per_screen).max(1) as usize;
    if let Some(key) = tracker.update_chapter_page_count(chapter, count) {
        if let Err(e) = store.save_page_count(&key.to_string(), count) {
            warn!("failed to store page count for {}: {}", key, e);
        }
    }
}
