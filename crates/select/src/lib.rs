//! Opskit select: paged single/multi-select menu over an ordered item list.
//!
//! The loop is line oriented and generic over its reader/writer so the CLI
//! can pass stdin/stdout while tests drive it with in-memory buffers. EOF on
//! the reader is treated as cancel, so an unattended run never blocks.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::io::{BufRead, Write};
use std::ops::Range;

use tracing::warn;

/// Visible slice of the item list. Derived state: navigation keeps
/// `page < total_pages()` at all times; out-of-range moves are no-ops.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PageWindow {
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl PageWindow {
    pub fn new(page_size: usize, total: usize) -> Self {
        Self { page: 0, page_size: page_size.max(1), total }
    }

    pub fn total_pages(&self) -> usize {
        if self.total == 0 { 1 } else { self.total.div_ceil(self.page_size) }
    }

    /// 0-based index range of the current page.
    pub fn range(&self) -> Range<usize> {
        let start = self.page * self.page_size;
        let end = (start + self.page_size).min(self.total);
        start..end
    }

    pub fn first(&mut self) {
        self.page = 0;
    }

    pub fn last(&mut self) {
        self.page = self.total_pages() - 1;
    }

    pub fn prev(&mut self) {
        if self.page > 0 {
            self.page -= 1;
        }
    }

    pub fn next(&mut self) {
        if self.page + 1 < self.total_pages() {
            self.page += 1;
        }
    }
}

/// Explicit loop state: current window plus the set of selected indices.
/// Created empty per invocation and discarded on return.
#[derive(Debug, Clone)]
pub struct SelectorState {
    pub window: PageWindow,
    pub selected: BTreeSet<usize>,
}

impl SelectorState {
    pub fn new(page_size: usize, total: usize) -> Self {
        Self { window: PageWindow::new(page_size, total), selected: BTreeSet::new() }
    }

    /// Toggle membership for a 0-based index. Duplicate indices in one input
    /// toggle twice on purpose (net no-op).
    pub fn toggle(&mut self, idx: usize) {
        if !self.selected.remove(&idx) {
            self.selected.insert(idx);
        }
    }

    /// Select (not toggle) every index on the current page.
    pub fn select_page(&mut self) {
        for idx in self.window.range() {
            self.selected.insert(idx);
        }
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Cancel,
    Indices(Vec<Result<usize, String>>),
    SelectPage,
    ClearAll,
    Done,
    PrevPage,
    FirstPage,
    NextPage,
    LastPage,
    Invalid(String),
}

fn parse_command(line: &str) -> Command {
    let t = line.trim();
    match t.to_ascii_lowercase().as_str() {
        "q" | "0" => return Command::Cancel,
        "a" => return Command::SelectPage,
        "c" => return Command::ClearAll,
        "d" => return Command::Done,
        "p" => return Command::PrevPage,
        "f" => return Command::FirstPage,
        "n" => return Command::NextPage,
        "l" => return Command::LastPage,
        "" => return Command::Invalid(String::new()),
        _ => {}
    }
    // index list: anything with a comma or leading digit; individual tokens
    // may still be non-numeric and get reported as invalid one by one
    if t.contains(',') || t.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        let tokens = t
            .split(',')
            .map(|tok| {
                let tok = tok.trim();
                tok.parse::<usize>().map_err(|_| tok.to_string())
            })
            .collect();
        Command::Indices(tokens)
    } else {
        Command::Invalid(t.to_string())
    }
}

/// Interactive selection over `items`. Returns the 0-based indices of the
/// chosen items in ascending order; an empty vector means canceled (or, in
/// multi mode, nothing selected). Empty input lists return immediately
/// without prompting.
pub fn select<T, R, W>(
    items: &[T],
    title: &str,
    display: impl Fn(&T) -> String,
    multiple: bool,
    page_size: usize,
    reader: &mut R,
    writer: &mut W,
) -> std::io::Result<Vec<usize>>
where
    R: BufRead,
    W: Write,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let mut state = SelectorState::new(page_size, items.len());
    let paginated = items.len() > state.window.page_size;

    loop {
        render(items, title, &display, multiple, paginated, &state, writer)?;
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            // EOF: treat as cancel so non-interactive runs cannot hang
            warn!("input closed; canceling selection");
            return Ok(Vec::new());
        }
        match parse_command(&line) {
            Command::Cancel => return Ok(Vec::new()),
            Command::Indices(tokens) => {
                if multiple {
                    for tok in tokens {
                        match tok {
                            Ok(n) if (1..=items.len()).contains(&n) => state.toggle(n - 1),
                            Ok(n) => writeln!(writer, "invalid selection: {}", n)?,
                            Err(raw) => writeln!(writer, "invalid selection: {}", raw)?,
                        }
                    }
                } else {
                    let mut picked = None;
                    for tok in &tokens {
                        match tok {
                            Ok(n) if (1..=items.len()).contains(n) => {
                                picked = Some(*n - 1);
                                break;
                            }
                            Ok(n) => writeln!(writer, "invalid selection: {}", n)?,
                            Err(raw) => writeln!(writer, "invalid selection: {}", raw)?,
                        }
                    }
                    if let Some(idx) = picked {
                        return Ok(vec![idx]);
                    }
                }
            }
            Command::SelectPage if multiple => state.select_page(),
            Command::ClearAll if multiple => state.clear(),
            Command::Done if multiple => {
                if state.selected.is_empty() {
                    writeln!(writer, "nothing selected yet")?;
                } else {
                    return Ok(state.selected.iter().copied().collect());
                }
            }
            Command::PrevPage => state.window.prev(),
            Command::FirstPage => state.window.first(),
            Command::NextPage => state.window.next(),
            Command::LastPage => state.window.last(),
            Command::Invalid(raw) => writeln!(writer, "invalid input: {}", raw)?,
            // a/c/d outside multi mode
            _ => writeln!(writer, "invalid input")?,
        }
    }
}

fn render<T, W: Write>(
    items: &[T],
    title: &str,
    display: &impl Fn(&T) -> String,
    multiple: bool,
    paginated: bool,
    state: &SelectorState,
    writer: &mut W,
) -> std::io::Result<()> {
    writeln!(writer, "{}", title)?;
    if paginated {
        writeln!(writer, "page {}/{}", state.window.page + 1, state.window.total_pages())?;
    }
    for idx in state.window.range() {
        if multiple {
            let mark = if state.selected.contains(&idx) { "x" } else { " " };
            writeln!(writer, "{:>3}. [{}] {}", idx + 1, mark, display(&items[idx]))?;
        } else {
            writeln!(writer, "{:>3}. {}", idx + 1, display(&items[idx]))?;
        }
    }
    let mut help = format!("select 1-{}", items.len());
    if multiple {
        help.push_str(", a=page, c=clear, d=done");
    }
    if paginated {
        help.push_str(", n/p/f/l=page nav");
    }
    help.push_str(", q=quit");
    writeln!(writer, "{}", help)?;
    write!(writer, "> ")?;
    writer.flush()
}
