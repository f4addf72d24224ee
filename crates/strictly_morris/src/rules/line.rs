//! Win detection: three pieces in a straight line.

use crate::Position;
use tracing::instrument;

/// Checks whether three cells lie on one row, one column, or a true diagonal.
///
/// Diagonals are detected with the 2D cross product of `b - a` and `c - a`
/// being zero while no two of the points share a row or column.
#[instrument]
pub fn forms_line(a: Position, b: Position, c: Position) -> bool {
    if a == b || b == c || a == c {
        return false;
    }

    let same_row = a.row() == b.row() && b.row() == c.row();
    let same_col = a.col() == b.col() && b.col() == c.col();
    if same_row || same_col {
        return true;
    }

    let (ax, ay) = (a.col() as i64, a.row() as i64);
    let (bx, by) = (b.col() as i64, b.row() as i64);
    let (cx, cy) = (c.col() as i64, c.row() as i64);
    let cross = (bx - ax) * (cy - ay) - (by - ay) * (cx - ax);

    cross == 0 && ax != bx && ay != by
}

/// Checks whether a side's pieces form a winning line.
///
/// Only a full set of pieces can win.
#[instrument]
pub fn has_line(pieces: &[Position]) -> bool {
    match pieces {
        [a, b, c] => forms_line(*a, *b, *c),
        _ => false,
    }
}
