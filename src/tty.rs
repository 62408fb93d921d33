use serde::{Deserialize, Serialize};

/// The character-cell size of a pty, used both for the pty we drive
/// `less` through and for the grid size a client asked a log session
/// to render at.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    pub fn new(cols: u16, rows: u16) -> Self {
        Size { rows, cols }
    }
}
