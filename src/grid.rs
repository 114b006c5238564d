//! A participant's identity on one grid: its local and global index boxes,
//! and the set of global point indices it owns.

use crate::error::{CouplerError, Result};

/// A half-open rectangular index range `[row_start, row_end) x [col_start,
/// col_end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Box2D {
    pub row_start: i64,
    pub row_end: i64,
    pub col_start: i64,
    pub col_end: i64,
}

impl Box2D {
    pub fn new(row_start: i64, row_end: i64, col_start: i64, col_end: i64) -> Self {
        Self {
            row_start,
            row_end,
            col_start,
            col_end,
        }
    }

    pub fn rows(&self) -> i64 {
        self.row_end - self.row_start
    }

    pub fn cols(&self) -> i64 {
        self.col_end - self.col_start
    }

    pub fn area(&self) -> i64 {
        self.rows() * self.cols()
    }

    pub fn contains_cell(&self, row: i64, col: i64) -> bool {
        row >= self.row_start && row < self.row_end && col >= self.col_start && col < self.col_end
    }

    /// Do `self` and `other` overlap (share at least one cell)?
    pub fn overlaps(&self, other: &Box2D) -> bool {
        self.row_start < other.row_end
            && other.row_start < self.row_end
            && self.col_start < other.col_end
            && other.col_start < self.col_end
    }
}

/// A participant's identity: grid name, rank, local box, global box, and the
/// derived set of owned global point indices.
///
/// Immutable after construction.
#[derive(Debug, Clone)]
pub struct GridDescriptor {
    name: String,
    rank: usize,
    local: Box2D,
    global: Box2D,
}

impl GridDescriptor {
    /// Validates `gis <= lis < lie <= gie` and `gjs <= ljs < lje <= gje`,
    /// failing with [`CouplerError::Config`] otherwise.
    pub fn new(name: impl Into<String>, rank: usize, local: Box2D, global: Box2D) -> Result<Self> {
        let name = name.into();
        if !(global.row_start <= local.row_start
            && local.row_start < local.row_end
            && local.row_end <= global.row_end)
        {
            return Err(CouplerError::config(format!(
                "grid '{name}': local row range [{}, {}) is not contained in global row range [{}, {})",
                local.row_start, local.row_end, global.row_start, global.row_end
            )));
        }
        if !(global.col_start <= local.col_start
            && local.col_start < local.col_end
            && local.col_end <= global.col_end)
        {
            return Err(CouplerError::config(format!(
                "grid '{name}': local col range [{}, {}) is not contained in global col range [{}, {})",
                local.col_start, local.col_end, global.col_start, global.col_end
            )));
        }
        Ok(Self {
            name,
            rank,
            local,
            global,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn local_box(&self) -> Box2D {
        self.local
    }

    pub fn global_box(&self) -> Box2D {
        self.global
    }

    /// Number of global columns in this grid, used to compute the dense
    /// global index `i * n_cols + j`.
    pub fn global_cols(&self) -> i64 {
        self.global.col_end - self.global.col_start
    }

    /// The global index of cell `(row, col)`.
    pub fn global_index(&self, row: i64, col: i64) -> u64 {
        (row * self.global_cols() + col) as u64
    }

    /// The `(row, col)` cell that a global index refers to.
    pub fn cell_of(&self, gidx: u64) -> (i64, i64) {
        let n_cols = self.global_cols();
        let gidx = gidx as i64;
        (gidx / n_cols, gidx % n_cols)
    }

    /// O(1) test of whether this process owns the given global index.
    pub fn contains(&self, gidx: u64) -> bool {
        let (row, col) = self.cell_of(gidx);
        self.local.contains_cell(row, col)
    }

    /// The number of points this process owns.
    pub fn num_owned(&self) -> usize {
        self.local.area() as usize
    }

    /// Iterate the global indices owned by this process, in row-major order
    /// (matches `original_source/lib/router.cc`'s construction loop).
    pub fn owned_points(&self) -> impl Iterator<Item = u64> + '_ {
        let n_cols = self.global_cols();
        (self.local.row_start..self.local.row_end).flat_map(move |row| {
            (self.local.col_start..self.local.col_end)
                .map(move |col| (row * n_cols + col) as u64)
        })
    }

    /// Offset of a global index within this process's local, row-major
    /// point buffer; `None` if the point is not owned.
    pub fn local_offset(&self, gidx: u64) -> Option<usize> {
        let (row, col) = self.cell_of(gidx);
        if !self.local.contains_cell(row, col) {
            return None;
        }
        let r = (row - self.local.row_start) as usize;
        let c = (col - self.local.col_start) as usize;
        Some(r * self.local.cols() as usize + c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> GridDescriptor {
        GridDescriptor::new(
            "atm",
            0,
            Box2D::new(1, 3, 1, 4),
            Box2D::new(0, 4, 0, 4),
        )
        .unwrap()
    }

    #[test]
    fn rejects_box_outside_global_domain() {
        let err = GridDescriptor::new("atm", 0, Box2D::new(0, 5, 0, 4), Box2D::new(0, 4, 0, 4));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_empty_local_box() {
        let err = GridDescriptor::new("atm", 0, Box2D::new(2, 2, 0, 4), Box2D::new(0, 4, 0, 4));
        assert!(err.is_err());
    }

    #[test]
    fn owned_points_match_global_index_formula() {
        let g = descriptor();
        let pts: Vec<u64> = g.owned_points().collect();
        assert_eq!(pts, vec![5, 6, 7, 9, 10, 11]);
        assert_eq!(g.num_owned(), 6);
    }

    #[test]
    fn contains_agrees_with_owned_points() {
        let g = descriptor();
        let owned: Vec<u64> = g.owned_points().collect();
        for gidx in 0..16u64 {
            assert_eq!(g.contains(gidx), owned.contains(&gidx));
        }
    }

    #[test]
    fn local_offset_round_trips_with_owned_points_order() {
        let g = descriptor();
        for (i, gidx) in g.owned_points().enumerate() {
            assert_eq!(g.local_offset(gidx), Some(i));
        }
        assert_eq!(g.local_offset(0), None);
    }

    #[test]
    fn identity_4x4_full_owner_round_trip() {
        let full = GridDescriptor::new(
            "ocean",
            0,
            Box2D::new(0, 4, 0, 4),
            Box2D::new(0, 4, 0, 4),
        )
        .unwrap();
        assert_eq!(full.num_owned(), 16);
        assert_eq!(full.owned_points().collect::<Vec<_>>(), (0..16).collect::<Vec<_>>());
    }
}
