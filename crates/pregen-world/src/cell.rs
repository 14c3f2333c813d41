/// Edge length, in cells, of the square bucket a batch is drawn from.
pub const BATCH_SPAN: i32 = 1 << BATCH_SHIFT;
const BATCH_SHIFT: u32 = 3;

#[inline]
const fn pack(a: i32, b: i32) -> i64 {
    ((a as u32 as u64) | ((b as u32 as u64) << 32)) as i64
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CellCoord {
    pub x: i32,
    pub z: i32,
}

impl CellCoord {
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    #[inline]
    pub fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            z: self.z + dz,
        }
    }

    #[inline]
    pub fn distance_sq(self, other: CellCoord) -> i64 {
        let dx = i64::from(self.x) - i64::from(other.x);
        let dz = i64::from(self.z) - i64::from(other.z);
        dx * dx + dz * dz
    }

    /// Chessboard distance; a radius `r` around a center covers `(2r+1)^2` cells.
    #[inline]
    pub fn chebyshev(self, other: CellCoord) -> i64 {
        let dx = (i64::from(self.x) - i64::from(other.x)).abs();
        let dz = (i64::from(self.z) - i64::from(other.z)).abs();
        dx.max(dz)
    }

    #[inline]
    pub const fn key(self) -> CellKey {
        CellKey(pack(self.x, self.z))
    }

    #[inline]
    pub const fn batch(self) -> BatchKey {
        BatchKey::new(self.x >> BATCH_SHIFT, self.z >> BATCH_SHIFT)
    }
}

impl From<(i32, i32)> for CellCoord {
    fn from(value: (i32, i32)) -> Self {
        Self::new(value.0, value.1)
    }
}

impl From<CellCoord> for (i32, i32) {
    fn from(value: CellCoord) -> Self {
        (value.x, value.z)
    }
}

/// Packed `(x, z)`: low 32 bits hold `x`, high 32 bits hold `z`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey(i64);

impl CellKey {
    #[inline]
    pub const fn new(x: i32, z: i32) -> Self {
        Self(pack(x, z))
    }

    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn x(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub const fn z(self) -> i32 {
        (self.0 >> 32) as i32
    }

    #[inline]
    pub const fn coord(self) -> CellCoord {
        CellCoord::new(self.x(), self.z())
    }
}

impl From<CellCoord> for CellKey {
    fn from(value: CellCoord) -> Self {
        value.key()
    }
}

impl From<CellKey> for CellCoord {
    fn from(value: CellKey) -> Self {
        value.coord()
    }
}

/// Bucket coordinates of a `BATCH_SPAN`-wide square, packed like [`CellKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey(i64);

impl BatchKey {
    #[inline]
    pub const fn new(bx: i32, bz: i32) -> Self {
        Self(pack(bx, bz))
    }

    #[inline]
    pub const fn bx(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub const fn bz(self) -> i32 {
        (self.0 >> 32) as i32
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Minimum corner of the bucket.
    #[inline]
    pub fn origin(self) -> CellCoord {
        CellCoord::new(self.bx() << BATCH_SHIFT, self.bz() << BATCH_SHIFT)
    }

    #[inline]
    pub fn contains(self, cell: CellCoord) -> bool {
        cell.batch() == self
    }

    /// Bit index of `cell` inside this bucket's 64-bit occupancy mask.
    #[inline]
    pub fn slot(cell: CellCoord) -> u32 {
        let lx = (cell.x & (BATCH_SPAN - 1)) as u32;
        let lz = (cell.z & (BATCH_SPAN - 1)) as u32;
        lz * BATCH_SPAN as u32 + lx
    }
}
