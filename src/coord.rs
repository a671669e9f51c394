//! Coordinate mapping between vision space and chess space.
//! Vision convention: column 0 is the left edge, row 0 is the TOP of the
//! rectified image (rank 8 side). Chess convention: file 0 = a, rank 0 = rank 1.
//! This is the only module that performs the row/rank flip; everything else
//! works in `shakmaty::Square` terms.

use shakmaty::{File, Rank, Square};

/// Maps a vision grid cell (col, row) to its chess square.
/// Row 0 is the top of the image, i.e. rank 8. Panics if col or row > 7.
pub fn vision_to_square(col: u32, row: u32) -> Square {
    assert!(col < 8 && row < 8, "vision cell ({col},{row}) out of range");
    Square::from_coords(File::new(col), Rank::new(7 - row))
}

/// Inverse of [`vision_to_square`]: chess square to (col, row) in the image.
pub fn square_to_vision(sq: Square) -> (u32, u32) {
    (u32::from(sq.file()), 7 - u32::from(sq.rank()))
}
