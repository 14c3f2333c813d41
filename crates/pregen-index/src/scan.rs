use pregen_world::{BATCH_SPAN, BatchKey, CellCoord};

/// Square of cells within chessboard `radius` of `center`.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ScanArea {
    center: CellCoord,
    lo: CellCoord,
    hi: CellCoord,
}

/// One bucket clipped to a [`ScanArea`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct BucketWindow {
    pub key: BatchKey,
    /// Slots of the bucket that fall inside the area.
    pub mask: u64,
    /// Squared distance from the area center to the nearest cell of the clipped bucket.
    pub min_dist_sq: i64,
}

#[inline]
fn rect_mask(lx0: u32, lx1: u32, lz0: u32, lz1: u32) -> u64 {
    let width = lx1 - lx0 + 1;
    let row = if width >= 64 {
        u64::MAX
    } else {
        ((1u64 << width) - 1) << lx0
    };
    let mut mask = 0u64;
    for lz in lz0..=lz1 {
        mask |= row << (lz * BATCH_SPAN as u32);
    }
    mask
}

impl ScanArea {
    pub fn new(center: CellCoord, radius: i32) -> Self {
        let r = radius.max(0);
        Self {
            center,
            lo: CellCoord::new(center.x.saturating_sub(r), center.z.saturating_sub(r)),
            hi: CellCoord::new(center.x.saturating_add(r), center.z.saturating_add(r)),
        }
    }

    /// Buckets overlapping the area in row-major bucket order.
    pub fn windows(&self) -> impl Iterator<Item = BucketWindow> + '_ {
        let (b_lo, b_hi) = (self.lo.batch(), self.hi.batch());
        (b_lo.bz()..=b_hi.bz()).flat_map(move |bz| {
            (b_lo.bx()..=b_hi.bx()).map(move |bx| self.window(BatchKey::new(bx, bz)))
        })
    }

    /// Buckets ordered by their nearest cell, ties broken by bucket `z` then `x`.
    pub fn windows_by_distance(&self) -> Vec<BucketWindow> {
        let mut all: Vec<BucketWindow> = self.windows().collect();
        all.sort_by_key(|w| (w.min_dist_sq, w.key.bz(), w.key.bx()));
        all
    }

    fn window(&self, key: BatchKey) -> BucketWindow {
        let origin = key.origin();
        let x0 = origin.x.max(self.lo.x);
        let x1 = (origin.x + (BATCH_SPAN - 1)).min(self.hi.x);
        let z0 = origin.z.max(self.lo.z);
        let z1 = (origin.z + (BATCH_SPAN - 1)).min(self.hi.z);
        let mask = rect_mask(
            (x0 - origin.x) as u32,
            (x1 - origin.x) as u32,
            (z0 - origin.z) as u32,
            (z1 - origin.z) as u32,
        );
        let nearest = CellCoord::new(self.center.x.clamp(x0, x1), self.center.z.clamp(z0, z1));
        BucketWindow {
            key,
            mask,
            min_dist_sq: nearest.distance_sq(self.center),
        }
    }

    /// Cells for the set bits of `bits` inside `window`, nearest to the center first.
    pub fn cells_nearest_first(&self, window: &BucketWindow, bits: u64) -> Vec<CellCoord> {
        let origin = window.key.origin();
        let mut cells = Vec::with_capacity(bits.count_ones() as usize);
        let mut rest = bits;
        while rest != 0 {
            let slot = rest.trailing_zeros() as i32;
            rest &= rest - 1;
            cells.push(origin.offset(slot % BATCH_SPAN, slot / BATCH_SPAN));
        }
        let center = self.center;
        cells.sort_by_key(|c| (c.distance_sq(center), c.z, c.x));
        cells
    }
}
