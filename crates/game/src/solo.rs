//! Solo "repeat the sequence" progression rules.

use crate::model::Cell;
use rand::Rng;

/// Levels 1-10 are played on a 3x3 grid.
pub const GRID_SIZE_3X3_MAX_LEVEL: u32 = 10;
/// Levels 11-20 are played on a 4x4 grid; later levels on 5x5.
pub const GRID_SIZE_4X4_MAX_LEVEL: u32 = 20;

pub fn grid_size_for_level(level: u32) -> u32 {
    if level <= GRID_SIZE_3X3_MAX_LEVEL {
        3
    } else if level <= GRID_SIZE_4X4_MAX_LEVEL {
        4
    } else {
        5
    }
}

/// Sequence of `level` cells drawn independently from the level's grid.
/// The same cell may appear more than once.
pub fn generate_sequence<R: Rng + ?Sized>(level: u32, rng: &mut R) -> Vec<Cell> {
    let grid_size = grid_size_for_level(level);
    (0..level)
        .map(|_| Cell {
            x: rng.gen_range(0..grid_size),
            y: rng.gen_range(0..grid_size),
        })
        .collect()
}

/// Position-exact equality: same length and the same cell at every index.
pub fn validate_sequence(submitted: &[Cell], expected: &[Cell]) -> bool {
    submitted.len() == expected.len()
        && submitted
            .iter()
            .zip(expected)
            .all(|(a, b)| a.x == b.x && a.y == b.y)
}
