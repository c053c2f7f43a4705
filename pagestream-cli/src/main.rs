use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event;
use crossterm::terminal::{self, Clear, ClearType};
use directories::ProjectDirs;
use pagestream_core::{
    DocumentId, DocumentKind, NavCommand, NavigationOutcome, PairingMode, ViewSnapshot,
    ViewerConfig, ViewerError, ViewerEvent, ViewportController,
};
use pagestream_render::{HttpTransport, ImageDecoder};
use pagestream_tty::{
    compose_spread, write_status_line, DrawParams, EventMapper, KittyRenderer, MouseCapture,
    UiEvent,
};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "pagestream",
    version,
    about = "Terminal viewer for comics and PDFs streamed page by page from a server"
)]
struct Args {
    /// Page server base URL
    #[arg(long)]
    server: Option<String>,

    /// Page pairing: single, double or cover
    #[arg(short = 'm', long = "mode", value_parser = parse_mode)]
    mode: Option<PairingMode>,

    /// Page to open the document on (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<u32>,

    /// Configuration file; defaults to config.toml in the platform config dir
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Server-side path of the document
    document: String,
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> anyhow::Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(stdout, cursor::Show);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let document = DocumentId::new(args.document.clone());
    if DocumentKind::detect(&document).is_none() {
        bail!("unsupported document type: {}", document.file_name());
    }

    let project_dirs = ProjectDirs::from("net", "pagestream", "pagestream")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&args, &project_dirs)?;
    info!(server = %config.transport.server, %document, "starting viewer");

    let transport = Arc::new(HttpTransport::new(&config.transport)?);
    let viewer = Arc::new(ViewportController::new(
        config.engine.clone(),
        transport,
        Arc::new(ImageDecoder),
    ));

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(stdout, cursor::Hide)?;
    viewer.attach_input(Box::new(MouseCapture::enable(io::stdout())?));

    {
        let viewer = Arc::clone(&viewer);
        let start_page = args.page.filter(|&page| page > 1);
        tokio::spawn(async move {
            report(viewer.open(document).await);
            if let Some(page) = start_page {
                report(viewer.navigate(NavCommand::JumpTo(page)).await);
            }
        });
    }

    let mut renderer = KittyRenderer::new(stdout);
    let mut event_mapper = EventMapper::new();
    let mut dirty = true;
    let mut status_dirty = true;

    loop {
        for event in viewer.take_events() {
            match event {
                ViewerEvent::SpreadChanged(_) | ViewerEvent::Closed => dirty = true,
                ViewerEvent::StateChanged(_)
                | ViewerEvent::StatusChanged(_)
                | ViewerEvent::TotalPagesDiscovered(_) => status_dirty = true,
            }
        }

        if dirty {
            redraw(&mut renderer, &viewer.view())?;
            dirty = false;
            status_dirty = true;
        }
        if status_dirty {
            let label = status_label(
                &viewer.view(),
                viewer.pairing_mode(),
                event_mapper.pending_input().as_deref(),
            );
            draw_status_line(&mut renderer, &label)?;
            status_dirty = false;
        }

        if event::poll(Duration::from_millis(50))? {
            let ui_event = event_mapper.map_event(event::read()?);
            status_dirty = true;
            match handle_event(ui_event, &viewer) {
                LoopAction::ContinueRedraw => dirty = true,
                LoopAction::Continue => {}
                LoopAction::Quit => break,
            }
        }
    }

    viewer.close();
    {
        let writer = renderer.writer();
        crossterm::execute!(writer, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    }
    Ok(())
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

/// Navigation runs on its own task so input stays responsive; a newer
/// command supersedes an older one inside the controller.
fn handle_event(event: UiEvent, viewer: &Arc<ViewportController>) -> LoopAction {
    match event {
        UiEvent::Navigate(command) => {
            let viewer = Arc::clone(viewer);
            tokio::spawn(async move { report(viewer.navigate(command).await) });
            LoopAction::Continue
        }
        UiEvent::CyclePairing => {
            let mode = viewer.pairing_mode().cycle();
            let viewer = Arc::clone(viewer);
            tokio::spawn(async move { report(viewer.set_pairing_mode(mode).await) });
            LoopAction::Continue
        }
        UiEvent::Redraw => LoopAction::ContinueRedraw,
        UiEvent::Quit => LoopAction::Quit,
        UiEvent::None => LoopAction::Continue,
    }
}

fn report(outcome: Result<NavigationOutcome, ViewerError>) {
    match outcome {
        Ok(NavigationOutcome::Failed(err)) => warn!(%err, "navigation failed"),
        Ok(outcome) => debug!(?outcome, "navigation finished"),
        Err(err) => warn!(%err, "navigation rejected"),
    }
}

fn redraw(renderer: &mut KittyRenderer<io::Stdout>, view: &ViewSnapshot) -> Result<()> {
    let window = terminal::window_size()?;
    let total_cols = u32::from(window.columns).max(1);
    let total_rows = u32::from(window.rows).max(1);
    let image_rows_available = total_rows.saturating_sub(1).max(1);

    renderer.begin_sync_update()?;
    renderer.clear_all()?;
    match view.left.as_deref() {
        Some(left) => {
            let image = compose_spread(left, view.right.as_deref());
            let params = DrawParams::fit(&image, total_cols, image_rows_available);
            let column = total_cols.saturating_sub(params.columns) / 2;
            crossterm::execute!(renderer.writer(), cursor::MoveTo(column as u16, 0))?;
            renderer.draw(&image, params)?;
        }
        None => renderer.delete_image()?,
    }
    renderer.end_sync_update()?;
    Ok(())
}

/// "Page 4–5 of 120 [cover] | Loading pages 6–7… | go to 12".
fn status_label(view: &ViewSnapshot, mode: PairingMode, pending_input: Option<&str>) -> String {
    let mut base = format!("{} [{}]", view.page_info, mode.label());
    if let Some(status) = view.status.as_deref() {
        base.push_str(" | ");
        base.push_str(status);
    }
    let pending = pending_input
        .filter(|digits| !digits.is_empty())
        .map(|digits| format!("go to {digits}"));
    combine_status(Some(base), pending.as_deref()).unwrap_or_default()
}

fn combine_status(base: Option<String>, pending_input: Option<&str>) -> Option<String> {
    match (base, pending_input.filter(|s| !s.is_empty())) {
        (Some(mut base), Some(pending)) => {
            base.push_str(" | ");
            base.push_str(pending);
            Some(base)
        }
        (Some(base), None) => Some(base),
        (None, Some(pending)) => Some(pending.to_string()),
        (None, None) => None,
    }
}

fn draw_status_line(renderer: &mut KittyRenderer<io::Stdout>, status: &str) -> Result<()> {
    let window = terminal::window_size()?;
    let total_rows = u32::from(window.rows).max(1);
    let status_row = total_rows.saturating_sub(1);
    let writer = renderer.writer();
    crossterm::execute!(
        writer,
        cursor::MoveTo(0, status_row as u16),
        Clear(ClearType::CurrentLine)
    )?;
    write_status_line(writer, status)?;
    Ok(())
}

fn parse_mode(value: &str) -> Result<PairingMode, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "single" => Ok(PairingMode::Single),
        "double" | "double-contiguous" => Ok(PairingMode::DoubleContiguous),
        "cover" | "double-cover" => Ok(PairingMode::DoubleCover),
        other => Err(format!(
            "unknown pairing mode {other:?} (expected single, double or cover)"
        )),
    }
}

fn load_config(args: &Args, project_dirs: &ProjectDirs) -> Result<ViewerConfig> {
    let mut config = match &args.config {
        Some(path) => ViewerConfig::load(path)?,
        None => ViewerConfig::load_or_default(&project_dirs.config_dir().join("config.toml"))?,
    };
    apply_overrides(&mut config, args);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut ViewerConfig, args: &Args) {
    if let Some(server) = &args.server {
        config.transport.server = server.clone();
    }
    if let Some(mode) = args.mode {
        config.engine.pairing = Some(mode);
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "pagestream.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal belongs to the viewer; logs only go to the file.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
