//! Board topology and screen geometry.
//!
//! Adjacency on this board is not the usual 8-neighbourhood: orthogonal
//! neighbours are always adjacent, but a diagonal step is only allowed when
//! one end is the center. Corner-to-corner steps are never adjacent.

use crate::Position;
use tracing::instrument;

/// Returns true if a piece may slide from `a` to `b` in one step.
///
/// The relation is symmetric and irreflexive.
pub fn adjacent(a: Position, b: Position) -> bool {
    if a == b {
        return false;
    }
    let dr = a.row().abs_diff(b.row());
    let dc = a.col().abs_diff(b.col());
    match (dr, dc) {
        (0, 1) | (1, 0) => true,
        (1, 1) => a.is_center() || b.is_center(),
        _ => false,
    }
}

/// All cells reachable from `pos` in one step.
pub fn neighbors(pos: Position) -> Vec<Position> {
    Position::ALL
        .into_iter()
        .filter(|other| adjacent(pos, *other))
        .collect()
}

/// Maps a rectangular drawing surface onto the 3x3 grid.
///
/// Cells are square, sized to fit the shorter dimension, and centered on
/// the surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardLayout {
    center_x: f32,
    center_y: f32,
    cell_size: f32,
}

impl BoardLayout {
    /// Creates a layout for a surface of `width` x `height`.
    #[instrument]
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            center_x: width / 2.0,
            center_y: height / 2.0,
            cell_size: (width / 3.0).min(height / 3.0),
        }
    }

    /// Edge length of one cell.
    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Half-width of the square hit window around each cell center.
    pub fn hit_radius(&self) -> f32 {
        self.cell_size / 5.0
    }

    /// Screen coordinates of the center of `pos`.
    pub fn cell_center(&self, pos: Position) -> (f32, f32) {
        let dx = pos.col() as f32 - 1.0;
        let dy = pos.row() as f32 - 1.0;
        (
            self.center_x + dx * self.cell_size,
            self.center_y + dy * self.cell_size,
        )
    }

    /// Cell hit by a point, if any.
    ///
    /// A point hits a cell when it lies inside that cell's hit window; if
    /// windows overlap the nearest center wins.
    #[instrument(skip(self))]
    pub fn cell_at(&self, x: f32, y: f32) -> Option<Position> {
        let radius = self.hit_radius();
        Position::ALL
            .into_iter()
            .filter_map(|pos| {
                let (cx, cy) = self.cell_center(pos);
                let (dx, dy) = (x - cx, y - cy);
                (dx.abs() <= radius && dy.abs() <= radius).then_some((pos, dx * dx + dy * dy))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(pos, _)| pos)
    }
}
