//! Screen modes, page flipping, and text-in-graphics over the framebuffer

use crate::console::Display;
use crate::font;
use crate::framebuffer::Framebuffer;

/// Resolution for a screen mode, if the mode exists.
pub fn mode_resolution(mode: u8) -> Option<(usize, usize)> {
    match mode {
        0 => Some((640, 200)),
        1 => Some((320, 200)),
        2 => Some((640, 200)),
        7 => Some((320, 200)),
        8 => Some((640, 200)),
        9 => Some((640, 350)),
        12 => Some((640, 480)),
        13 => Some((320, 200)),
        14 => Some((640, 480)),
        15 => Some((640, 480)),
        16 => Some((800, 600)),
        17 => Some((800, 600)),
        18 => Some((1024, 768)),
        19 => Some((1024, 768)),
        _ => None,
    }
}

/// Character cell height for a mode; width is always 8.
fn cell_height(mode: u8) -> usize {
    match mode {
        9 => 14,
        12 => 16,
        _ => 8,
    }
}

/// Pen state for the DRAW macro language.
struct DrawPen {
    scale: f64,
    color: i64,
}

/// Two framebuffer pages plus the drawing/cursor state shared by the
/// graphics statements.
pub struct Graphics {
    mode: u8,
    pages: [Framebuffer; 2],
    active_page: usize,
    visual_page: usize,
    foreground: i64,
    background: i64,
    /// 1-based text cursor
    cursor_row: u32,
    cursor_col: u32,
    last_x: i32,
    last_y: i32,
    draw_scale: f64,
}

impl Graphics {
    pub fn new() -> Self {
        let (w, h) = mode_resolution(0).unwrap();
        Self {
            mode: 0,
            pages: [Framebuffer::new(w, h), Framebuffer::new(w, h)],
            active_page: 0,
            visual_page: 0,
            foreground: 15,
            background: 0,
            cursor_row: 1,
            cursor_col: 1,
            last_x: (w / 2) as i32,
            last_y: (h / 2) as i32,
            draw_scale: 1.0,
        }
    }

    pub fn mode(&self) -> u8 {
        self.mode
    }

    pub fn width(&self) -> usize {
        self.pages[0].width()
    }

    pub fn height(&self) -> usize {
        self.pages[0].height()
    }

    pub fn foreground(&self) -> i64 {
        self.foreground
    }

    pub fn background(&self) -> i64 {
        self.background
    }

    pub fn set_colors(&mut self, fg: Option<i64>, bg: Option<i64>) {
        if let Some(fg) = fg {
            self.foreground = fg;
        }
        if let Some(bg) = bg {
            self.background = bg;
        }
    }

    pub fn cursor(&self) -> (u32, u32) {
        (self.cursor_row, self.cursor_col)
    }

    pub fn locate(&mut self, row: Option<u32>, col: Option<u32>) {
        if let Some(r) = row {
            self.cursor_row = r.max(1);
        }
        if let Some(c) = col {
            self.cursor_col = c.max(1);
        }
    }

    pub fn last_point(&self) -> (i32, i32) {
        (self.last_x, self.last_y)
    }

    pub fn set_last_point(&mut self, x: i32, y: i32) {
        self.last_x = x;
        self.last_y = y;
    }

    /// The page drawing statements target.
    pub fn active(&mut self) -> &mut Framebuffer {
        &mut self.pages[self.active_page]
    }

    pub fn active_ref(&self) -> &Framebuffer {
        &self.pages[self.active_page]
    }

    /// The page `present` shows.
    pub fn visual(&self) -> &Framebuffer {
        &self.pages[self.visual_page]
    }

    /// Switch modes and/or pages. A mode change reallocates and clears
    /// both pages; a page-only change is a fast flip.
    pub fn set_screen(&mut self, mode: u8, active: Option<usize>, visual: Option<usize>) -> bool {
        let Some((w, h)) = mode_resolution(mode) else {
            return false;
        };

        if mode != self.mode || w != self.width() || h != self.height() {
            log::debug!("screen mode {} -> {} ({}x{})", self.mode, mode, w, h);
            self.mode = mode;
            self.pages = [Framebuffer::new(w, h), Framebuffer::new(w, h)];
            self.foreground = 15;
            self.background = 0;
            self.cursor_row = 1;
            self.cursor_col = 1;
            self.last_x = (w / 2) as i32;
            self.last_y = (h / 2) as i32;
            self.draw_scale = 1.0;
        }

        if let Some(a) = active {
            self.active_page = a.min(1);
        }
        if let Some(v) = visual {
            self.visual_page = v.min(1);
        }
        true
    }

    /// Clear the active page to the background color and home the cursor.
    pub fn cls(&mut self) {
        let bg = self.background;
        self.active().clear(bg);
        self.cursor_row = 1;
        self.cursor_col = 1;
    }

    pub fn set_palette_entry(&mut self, index: u8, packed: u32) {
        for page in &mut self.pages {
            page.set_palette_entry(index, packed);
        }
    }

    pub fn reset_palette(&mut self) {
        for page in &mut self.pages {
            page.reset_palette();
        }
    }

    /// Text grid dimensions for the current mode.
    pub fn text_dims(&self) -> (u32, u32) {
        let cols = (self.width() / font::GLYPH_WIDTH) as u32;
        let rows = (self.height() / cell_height(self.mode)) as u32;
        (cols, rows)
    }

    /// Rasterize text at the cursor, wrapping and scrolling as needed.
    pub fn print_text(&mut self, text: &str, newline: bool) {
        for c in text.chars() {
            self.put_char(c);
        }
        if newline {
            self.cursor_col = 1;
            self.cursor_row += 1;
            self.scroll_if_needed();
        }
    }

    fn put_char(&mut self, c: char) {
        let (cols, _) = self.text_dims();
        if self.cursor_col > cols {
            self.cursor_col = 1;
            self.cursor_row += 1;
        }
        self.scroll_if_needed();

        let cell_h = cell_height(self.mode);
        let x0 = (self.cursor_col as i32 - 1) * font::GLYPH_WIDTH as i32;
        let y0 = (self.cursor_row as i32 - 1) * cell_h as i32;
        let (fg, bg) = (self.foreground, self.background);

        let rows = *font::glyph(c);
        let fb = self.active();
        for dy in 0..cell_h {
            let bits = if dy < font::GLYPH_HEIGHT { rows[dy] } else { 0 };
            for dx in 0..font::GLYPH_WIDTH {
                let color = if bits >> dx & 1 != 0 { fg } else { bg };
                fb.set_pixel(x0 + dx as i32, y0 + dy as i32, color);
            }
        }

        self.cursor_col += 1;
    }

    fn scroll_if_needed(&mut self) {
        let (_, rows) = self.text_dims();
        let cell_h = cell_height(self.mode);
        while self.cursor_row > rows {
            let bg = self.background;
            self.active().scroll_up(cell_h, bg);
            self.cursor_row -= 1;
        }
    }

    /// Hand the visual page to the display collaborator.
    pub fn present(&self, display: &mut dyn Display) {
        let page = self.visual();
        display.present(page.bgra(), page.width(), page.height());
    }

    /// The DRAW macro subset: moves (`U D L R E F G H`, `M x,y`), color
    /// (`C n`), scale (`S n`), with `B` (blind move) and `N` (no position
    /// update) prefixes. Unknown letters are skipped with their argument.
    pub fn draw_macro(&mut self, commands: &str) {
        let chars: Vec<char> = commands.chars().collect();
        let mut i = 0;
        let mut pen = DrawPen { scale: self.draw_scale, color: self.foreground };
        let mut blind = false;
        let mut stay = false;

        while i < chars.len() {
            let c = chars[i].to_ascii_uppercase();
            i += 1;
            match c {
                ' ' | ';' => continue,
                'B' => blind = true,
                'N' => stay = true,
                'C' => {
                    let n = parse_draw_number(&chars, &mut i).unwrap_or(pen.color as f64);
                    pen.color = n as i64;
                }
                'S' => {
                    let n = parse_draw_number(&chars, &mut i).unwrap_or(4.0);
                    pen.scale = n / 4.0;
                }
                'M' => {
                    // M [+|-]x,[+|-]y - a sign makes the coordinate relative
                    let relative = matches!(chars.get(i), Some('+' | '-'));
                    let x = parse_draw_number(&chars, &mut i).unwrap_or(0.0);
                    if chars.get(i) == Some(&',') {
                        i += 1;
                    }
                    let y = parse_draw_number(&chars, &mut i).unwrap_or(0.0);
                    let (tx, ty) = if relative {
                        (self.last_x + x as i32, self.last_y + y as i32)
                    } else {
                        (x as i32, y as i32)
                    };
                    self.pen_move(tx, ty, &pen, blind, stay);
                    blind = false;
                    stay = false;
                }
                'U' | 'D' | 'L' | 'R' | 'E' | 'F' | 'G' | 'H' => {
                    let n = parse_draw_number(&chars, &mut i).unwrap_or(1.0);
                    let step = (n * pen.scale).round() as i32;
                    let (dx, dy) = match c {
                        'U' => (0, -step),
                        'D' => (0, step),
                        'L' => (-step, 0),
                        'R' => (step, 0),
                        'E' => (step, -step),
                        'F' => (step, step),
                        'G' => (-step, step),
                        _ => (-step, -step), // H
                    };
                    let (tx, ty) = (self.last_x + dx, self.last_y + dy);
                    self.pen_move(tx, ty, &pen, blind, stay);
                    blind = false;
                    stay = false;
                }
                _ => {
                    // Unimplemented macro letter; drop its argument
                    let _ = parse_draw_number(&chars, &mut i);
                }
            }
        }
        self.draw_scale = pen.scale;
    }

    fn pen_move(&mut self, tx: i32, ty: i32, pen: &DrawPen, blind: bool, stay: bool) {
        if !blind {
            let (fx, fy) = (self.last_x, self.last_y);
            let color = pen.color;
            self.active().draw_line(fx, fy, tx, ty, color);
        }
        if !stay {
            self.last_x = tx;
            self.last_y = ty;
        }
    }
}

impl Default for Graphics {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_draw_number(chars: &[char], i: &mut usize) -> Option<f64> {
    let mut s = String::new();
    if matches!(chars.get(*i), Some('+' | '-')) {
        s.push(chars[*i]);
        *i += 1;
    }
    while matches!(chars.get(*i), Some(c) if c.is_ascii_digit()) {
        s.push(chars[*i]);
        *i += 1;
    }
    if s.is_empty() || s == "+" || s == "-" {
        None
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_table_matches_screen_sizes() {
        assert_eq!(mode_resolution(9), Some((640, 350)));
        assert_eq!(mode_resolution(13), Some((320, 200)));
        assert_eq!(mode_resolution(19), Some((1024, 768)));
        assert_eq!(mode_resolution(3), None);
    }

    #[test]
    fn mode_change_reallocates_and_clears() {
        let mut g = Graphics::new();
        assert!(g.set_screen(9, None, None));
        assert_eq!((g.width(), g.height()), (640, 350));
        g.active().set_pixel(5, 5, 14);
        assert!(g.set_screen(12, None, None));
        assert_eq!((g.width(), g.height()), (640, 480));
        assert_eq!(g.active_ref().get_pixel(5, 5), 0);
    }

    #[test]
    fn page_flip_does_not_clear() {
        let mut g = Graphics::new();
        g.set_screen(7, None, None);
        g.active().set_pixel(3, 3, 2);
        // Page-only change: drawing survives
        g.set_screen(7, Some(1), Some(0));
        assert_eq!(g.visual().get_pixel(3, 3), 2);
        // And the new active page is the other one
        g.active().set_pixel(4, 4, 5);
        assert_eq!(g.visual().get_pixel(4, 4), 0);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let mut g = Graphics::new();
        assert!(!g.set_screen(99, None, None));
        assert_eq!(g.mode(), 0);
    }

    #[test]
    fn print_text_puts_ink_in_the_cell() {
        let mut g = Graphics::new();
        g.set_screen(12, None, None);
        g.print_text("A", false);
        let mut ink = 0;
        for y in 0..16 {
            for x in 0..8 {
                if g.active_ref().get_pixel(x, y) == 15 {
                    ink += 1;
                }
            }
        }
        assert!(ink > 0);
        assert_eq!(g.cursor(), (1, 2));
    }

    #[test]
    fn newline_advances_row() {
        let mut g = Graphics::new();
        g.set_screen(12, None, None);
        g.print_text("HI", true);
        assert_eq!(g.cursor(), (2, 1));
    }

    #[test]
    fn draw_macro_moves_and_draws() {
        let mut g = Graphics::new();
        g.set_screen(12, None, None);
        g.set_last_point(100, 100);
        g.draw_macro("C4 R10 D10");
        assert_eq!(g.last_point(), (110, 110));
        assert_eq!(g.active_ref().get_pixel(105, 100), 4);
        assert_eq!(g.active_ref().get_pixel(110, 105), 4);
    }

    #[test]
    fn draw_blind_prefix_moves_without_ink() {
        let mut g = Graphics::new();
        g.set_screen(12, None, None);
        g.set_last_point(50, 50);
        g.draw_macro("BR10");
        assert_eq!(g.last_point(), (60, 50));
        assert_eq!(g.active_ref().get_pixel(55, 50), 0);
    }
}
