use std::io::{self, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{
        DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
        KeyModifiers, MouseEvent, MouseEventKind,
    },
    terminal::{Clear, ClearType},
};
use pagestream_core::{InputBinding, NavCommand, RenderImage};
use png::{BitDepth, ColorType, Encoder};
use tracing::warn;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }

    /// Largest cell box inside `columns` x `rows` that keeps the image's
    /// aspect ratio. Cells are assumed twice as tall as they are wide.
    pub fn fit(image: &RenderImage, columns: u32, rows: u32) -> Self {
        let columns = u64::from(columns.max(1));
        let rows = u64::from(rows.max(1));
        let width = u64::from(image.width.max(1));
        let height = u64::from(image.height.max(1));

        let rows_at_full_width = columns * height / (2 * width);
        if rows_at_full_width <= rows {
            return Self::clamped(columns as u32, rows_at_full_width as u32);
        }
        let columns_at_full_height = rows * 2 * width / height;
        Self::clamped(columns_at_full_height as u32, rows as u32)
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` as PNG and places it at the cursor, replacing the
    /// previous placement.
    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let mut buffer = Vec::new();
        let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
        encoder.set_color(ColorType::Rgba);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder.write_header()?;
        writer.write_image_data(&image.pixels)?;
        writer.finish()?;

        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},s={},v={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    image.width,
                    image.height,
                    u8::from(more)
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", u8::from(more))?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes the placed page image, e.g. when the document has no pages.
    pub fn delete_image(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// The terminal renders all buffered changes at once.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

/// Places `left` and `right` side by side, vertically centred, on a
/// transparent canvas.
pub fn compose_spread(left: &RenderImage, right: Option<&RenderImage>) -> RenderImage {
    let Some(right) = right else {
        return left.clone();
    };
    let width = left.width + right.width;
    let height = left.height.max(right.height);
    let mut pixels = vec![0u8; width as usize * height as usize * 4];

    for (page, x_offset) in [(left, 0), (right, left.width)] {
        let y_offset = (height - page.height) / 2;
        let row_bytes = page.width as usize * 4;
        for row in 0..page.height as usize {
            let source = &page.pixels[row * row_bytes..(row + 1) * row_bytes];
            let start = ((y_offset as usize + row) * width as usize + x_offset as usize) * 4;
            pixels[start..start + row_bytes].copy_from_slice(source);
        }
    }

    RenderImage {
        width,
        height,
        pixels,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Navigate(NavCommand),
    CyclePairing,
    Redraw,
    Quit,
    None,
}

/// Turns terminal events into viewer commands. Digits accumulate into a
/// page number that Enter submits.
#[derive(Debug, Default)]
pub struct EventMapper {
    pending_digits: String,
}

impl EventMapper {
    const MAX_DIGITS: usize = 9;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn map_event(&mut self, event: Event) -> UiEvent {
        match event {
            Event::Key(key) => self.map_key(key),
            Event::Mouse(MouseEvent { kind, .. }) => match kind {
                MouseEventKind::ScrollUp => UiEvent::Navigate(NavCommand::Previous),
                MouseEventKind::ScrollDown => UiEvent::Navigate(NavCommand::Next),
                _ => UiEvent::None,
            },
            Event::Resize(_, _) => UiEvent::Redraw,
            _ => UiEvent::None,
        }
    }

    fn map_key(&mut self, key: KeyEvent) -> UiEvent {
        if key.kind == KeyEventKind::Release {
            return UiEvent::None;
        }
        match (key.code, key.modifiers) {
            (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                UiEvent::Quit
            }
            (KeyCode::Char(c), KeyModifiers::NONE) if c.is_ascii_digit() => {
                if self.pending_digits.len() < Self::MAX_DIGITS {
                    self.pending_digits.push(c);
                }
                UiEvent::None
            }
            (KeyCode::Backspace, _) => {
                self.pending_digits.pop();
                UiEvent::None
            }
            (KeyCode::Esc, _) => {
                self.pending_digits.clear();
                UiEvent::None
            }
            (KeyCode::Enter, _) => match self.take_page() {
                Some(page) => UiEvent::Navigate(NavCommand::JumpTo(page)),
                None => UiEvent::None,
            },
            (code, _) => {
                self.pending_digits.clear();
                match code {
                    KeyCode::Left | KeyCode::Char('a') => UiEvent::Navigate(NavCommand::Previous),
                    KeyCode::Right | KeyCode::Char('d') => UiEvent::Navigate(NavCommand::Next),
                    KeyCode::Home => UiEvent::Navigate(NavCommand::First),
                    KeyCode::End => UiEvent::Navigate(NavCommand::Last),
                    KeyCode::Char('p') => UiEvent::CyclePairing,
                    KeyCode::Char('q') => UiEvent::Quit,
                    _ => UiEvent::None,
                }
            }
        }
    }

    fn take_page(&mut self) -> Option<u32> {
        let digits = std::mem::take(&mut self.pending_digits);
        digits.parse().ok()
    }

    /// The page number typed so far, if any.
    pub fn pending_input(&self) -> Option<String> {
        if self.pending_digits.is_empty() {
            None
        } else {
            Some(self.pending_digits.clone())
        }
    }
}

/// Mouse reporting for wheel navigation, enabled for as long as a document
/// is open.
pub struct MouseCapture<W: Write + Send> {
    writer: W,
    active: bool,
}

impl<W: Write + Send> MouseCapture<W> {
    pub fn enable(mut writer: W) -> io::Result<Self> {
        crossterm::execute!(writer, EnableMouseCapture)?;
        Ok(Self {
            writer,
            active: true,
        })
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl<W: Write + Send> InputBinding for MouseCapture<W> {
    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(err) = crossterm::execute!(self.writer, DisableMouseCapture) {
            warn!(%err, "failed to disable mouse capture");
        }
    }
}

impl<W: Write + Send> Drop for MouseCapture<W> {
    fn drop(&mut self) {
        self.release();
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
