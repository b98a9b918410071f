use ndarray::Array2;

pub const COLUMNS: usize = 80;
pub const ROWS: usize = 336;
/// Columns are addressed in pairs.
pub const DOUBLE_COLUMNS: u32 = 40;

/// One value per pixel, indexed `[column, row]`.
pub type PixelMask = Array2<u8>;

/// Enable mask for one step of a `steps`-step shift.
///
/// Every `steps`-th row is enabled, starting at `shift` in the first column of
/// each double column and at `shift + steps / 2` in the second one, so
/// neighbouring enabled pixels are spread apart. Over `shift = 0..steps` each
/// pixel is enabled exactly once. Pixels set in `excluded` are never enabled.
/// `excluded` is expected to be `COLUMNS` x `ROWS`; a plan checks this in
/// `MaskPlan::validate`.
pub fn make_pixel_mask(steps: u32, shift: u32, excluded: Option<&Array2<bool>>) -> PixelMask {
    let steps = steps.max(1) as usize;
    let shift = shift as usize;
    let first_offset = shift % steps;
    let second_offset = (steps / 2 + shift) % steps;

    Array2::from_shape_fn((COLUMNS, ROWS), |(col, row)| {
        if excluded.is_some_and(|ex| ex.get((col, row)).copied().unwrap_or(false)) {
            return 0;
        }
        let offset = if col % 2 == 0 { first_offset } else { second_offset };
        u8::from(row % steps == offset)
    })
}
