//! Automatrix LED patterns
//!
//! The Automatrix is a 16x16 LED matrix driven by a chain of 32 eight-bit
//! shift registers loaded over SPI. A [`Pattern`] is the on/off grid; a
//! [`PatternEncoder`] turns it into the 32-byte [`Frame`] clocked out with
//! [`SpiSession::transact`](crate::spi::SpiSession::transact).
//!
//! Shift registers are placed on an 8x4 grid, each one driving a 2x4 block
//! of LEDs:
//!
//! ```text
//! shifters         LEDs in a block
//!  7 15 23 31       4 5 6 7
//!  6 14 22 30       0 1 2 3
//!  5 13 21 29
//!  4 12 20 28
//!  3 11 19 27
//!  2 10 18 26
//!  1  9 17 25
//!  0  8 16 24
//! ```
//!
//! Board routing may permute a block's LEDs across the register outputs; the
//! [`LedMap`] describes that permutation and defaults to identity.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, PatternError};

/// LEDs per matrix side
pub const MATRIX_DIM: usize = 16;

/// Shift registers in the chain, one frame byte each
pub const SHIFTERS: usize = 32;

/// Parallel outputs per shift register
pub const PARALLEL_OUT: usize = 8;

/// Most LEDs the matrix supply can light at once
pub const POWER_BUDGET: usize = 164;

pub const DEFAULT_OUTER_RADIUS: f64 = 4.0;
pub const DEFAULT_INNER_RADIUS: f64 = 3.0;

/// One encoded pattern, first byte to the first shift register
pub type Frame = [u8; SHIFTERS];

/// Shift register and LED index driving grid cell `(col, row)`
///
/// `grid_to_shift(7, 3)` is shift register 9, LED 7.
pub const fn grid_to_shift(col: usize, row: usize) -> (usize, usize) {
    let shift = row / 2 + (col / 4) * 8;
    let led = col % 4 + (row % 2) * 4;
    (shift, led)
}

/// Grid cell `(col, row)` lit by LED `led` of shift register `shift`
pub const fn shift_to_grid(shift: usize, led: usize) -> (usize, usize) {
    let col = (shift / 8) * 4 + led % 4;
    let row = (shift % 8) * 2 + led / 4;
    (col, row)
}

/// 16x16 on/off grid, addressed by column then row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pattern {
    cells: [[bool; MATRIX_DIM]; MATRIX_DIM],
}

impl Pattern {
    /// All LEDs off
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pattern by asking `lit(col, row)` for every cell
    pub fn from_fn(mut lit: impl FnMut(usize, usize) -> bool) -> Self {
        let mut pattern = Self::new();
        for col in 0..MATRIX_DIM {
            for row in 0..MATRIX_DIM {
                pattern.cells[col][row] = lit(col, row);
            }
        }
        pattern
    }

    pub fn get(&self, col: usize, row: usize) -> bool {
        self.cells[col][row]
    }

    pub fn set(&mut self, col: usize, row: usize, on: bool) {
        self.cells[col][row] = on;
    }

    /// Number of LEDs switched on
    pub fn lit(&self) -> usize {
        self.cells.iter().flatten().filter(|&&on| on).count()
    }

    /// Load a pattern from a text file, see [`Pattern::from_str`]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse().map_err(ConfigError::Pattern)
    }
}

/// Parses 16 lines of 16 cells, one line per row starting at row 0.
/// `#`, `1`, `x` and `X` are lit; `.` and `0` are dark. Blank lines are
/// ignored.
impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lines: Vec<&str> = s.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let shape_error = |cols| PatternError::Shape {
            rows: lines.len(),
            cols,
        };

        if lines.len() != MATRIX_DIM {
            return Err(shape_error(lines.first().map_or(0, |l| l.chars().count())));
        }

        let mut pattern = Pattern::new();
        for (row, line) in lines.iter().enumerate() {
            let width = line.chars().count();
            if width != MATRIX_DIM {
                return Err(shape_error(width));
            }
            for (col, found) in line.chars().enumerate() {
                let on = match found {
                    '#' | '1' | 'x' | 'X' => true,
                    '.' | '0' => false,
                    _ => return Err(PatternError::InvalidCell { row, col, found }),
                };
                pattern.set(col, row, on);
            }
        }
        Ok(pattern)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in 0..MATRIX_DIM {
            let line: String = (0..MATRIX_DIM)
                .map(|col| if self.get(col, row) { '#' } else { '.' })
                .collect();
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Which register output each LED of a 2x4 block is wired to
///
/// Entry `i` is the bit position (0 = most significant) that drives LED `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct LedMap([u8; PARALLEL_OUT]);

impl LedMap {
    pub const IDENTITY: LedMap = LedMap([0, 1, 2, 3, 4, 5, 6, 7]);

    /// Accepts only permutations of `0..8`
    pub fn new(map: [u8; PARALLEL_OUT]) -> Result<Self, PatternError> {
        let mut seen = [false; PARALLEL_OUT];
        for &bit in &map {
            match seen.get_mut(bit as usize) {
                Some(slot) if !*slot => *slot = true,
                _ => return Err(PatternError::InvalidLedMap(map.to_vec())),
            }
        }
        Ok(Self(map))
    }

    /// Bit position driving `led`
    pub fn bit(&self, led: usize) -> u8 {
        self.0[led]
    }
}

impl Default for LedMap {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl TryFrom<Vec<u8>> for LedMap {
    type Error = PatternError;

    fn try_from(map: Vec<u8>) -> Result<Self, Self::Error> {
        let fixed: [u8; PARALLEL_OUT] = map
            .as_slice()
            .try_into()
            .map_err(|_| PatternError::InvalidLedMap(map.clone()))?;
        Self::new(fixed)
    }
}

impl From<LedMap> for Vec<u8> {
    fn from(map: LedMap) -> Self {
        map.0.to_vec()
    }
}

/// Converts between [`Pattern`] grids and shift register [`Frame`]s
#[derive(Debug, Clone, Default)]
pub struct PatternEncoder {
    led_map: LedMap,
}

impl PatternEncoder {
    pub fn new(led_map: LedMap) -> Self {
        Self { led_map }
    }

    pub fn led_map(&self) -> LedMap {
        self.led_map
    }

    /// Encode a pattern, refusing ones that exceed the power budget
    pub fn encode(&self, pattern: &Pattern) -> Result<Frame, PatternError> {
        let lit = pattern.lit();
        if lit > POWER_BUDGET {
            return Err(PatternError::PowerBudget {
                lit,
                budget: POWER_BUDGET,
            });
        }

        let mut frame = [0u8; SHIFTERS];
        for col in 0..MATRIX_DIM {
            for row in 0..MATRIX_DIM {
                if pattern.get(col, row) {
                    let (shift, led) = grid_to_shift(col, row);
                    frame[shift] |= 0x80 >> self.led_map.bit(led);
                }
            }
        }
        Ok(frame)
    }

    /// Recover the grid a frame lights
    pub fn decode(&self, frame: &Frame) -> Pattern {
        let mut pattern = Pattern::new();
        for (shift, byte) in frame.iter().enumerate() {
            for led in 0..PARALLEL_OUT {
                let (col, row) = shift_to_grid(shift, led);
                pattern.set(col, row, byte & (0x80 >> self.led_map.bit(led)) != 0);
            }
        }
        pattern
    }
}

/// Ordered sequence of encoded frames
#[derive(Debug, Clone, Default)]
pub struct PatternStream {
    encoder: PatternEncoder,
    frames: Vec<Frame>,
}

impl PatternStream {
    pub fn new(encoder: PatternEncoder) -> Self {
        Self {
            encoder,
            frames: Vec::new(),
        }
    }

    /// Encode `pattern` and append it to the sequence
    pub fn push(&mut self, pattern: &Pattern) -> Result<(), PatternError> {
        let frame = self.encoder.encode(pattern)?;
        debug!(
            "added pattern {} ({} LEDs lit)",
            self.frames.len(),
            pattern.lit()
        );
        self.frames.push(frame);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The sequence decoded back into grids
    pub fn patterns(&self) -> Vec<Pattern> {
        self.frames.iter().map(|f| self.encoder.decode(f)).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Squared distance of a cell from the matrix centre
fn radius_sq(col: usize, row: usize) -> f64 {
    let centre = MATRIX_DIM as f64 / 2.0 - 0.5;
    (col as f64 - centre).powi(2) + (row as f64 - centre).powi(2)
}

/// Half rings for differential phase contrast: upper, lower, left, right
///
/// Each keeps the cells of the ring `inner < r <= outer` on one side of
/// the centre.
pub fn dpc_patterns(outer: f64, inner: f64) -> [Pattern; 4] {
    let centre = MATRIX_DIM as f64 / 2.0 - 0.5;
    let ring = move |col: usize, row: usize| {
        let r = radius_sq(col, row);
        r <= outer * outer && r > inner * inner
    };
    [
        Pattern::from_fn(|col, row| ring(col, row) && row as f64 > centre),
        Pattern::from_fn(|col, row| ring(col, row) && (row as f64) < centre),
        Pattern::from_fn(|col, row| ring(col, row) && col as f64 > centre),
        Pattern::from_fn(|col, row| ring(col, row) && (col as f64) < centre),
    ]
}

/// Single half ring `inner < r < outer` used while focusing
pub fn focus_pattern(outer: f64, inner: f64) -> Pattern {
    let centre = MATRIX_DIM as f64 / 2.0 - 0.5;
    Pattern::from_fn(|col, row| {
        let r = radius_sq(col, row);
        inner * inner < r && r < outer * outer && col as f64 > centre
    })
}

/// Pattern settings, read from the `[pattern]` table of the config file
///
/// ```toml
/// [pattern]
/// led_map = [0, 1, 2, 3, 4, 5, 6, 7]
/// outer_radius = 4.0
/// inner_radius = 3.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub led_map: LedMap,
    pub outer_radius: f64,
    pub inner_radius: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            led_map: LedMap::IDENTITY,
            outer_radius: DEFAULT_OUTER_RADIUS,
            inner_radius: DEFAULT_INNER_RADIUS,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct PatternTable {
    #[serde(default)]
    pattern: PatternConfig,
}

impl PatternConfig {
    /// Read the `[pattern]` table; other keys are left to their owners
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: PatternTable = toml::from_str(content)?;
        Ok(table.pattern)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Render as a `[pattern]` table
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(&PatternTable {
            pattern: self.clone(),
        })
    }

    pub fn encoder(&self) -> PatternEncoder {
        PatternEncoder::new(self.led_map)
    }

    /// Built-in pattern set by name: `upper`, `lower`, `left`, `right`,
    /// `dpc` (all four in that order), `focus` or `off`
    pub fn builtin(&self, name: &str) -> Option<Vec<Pattern>> {
        let [upper, lower, left, right] = dpc_patterns(self.outer_radius, self.inner_radius);
        let patterns = match name {
            "upper" => vec![upper],
            "lower" => vec![lower],
            "left" => vec![left],
            "right" => vec![right],
            "dpc" => vec![upper, lower, left, right],
            "focus" => vec![focus_pattern(self.outer_radius, self.inner_radius)],
            "off" => vec![Pattern::new()],
            _ => return None,
        };
        Some(patterns)
    }
}
