use super::{RectFloat, XYXY};
use crate::common::*;

/// A box tagged with the index of the image it belongs to in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Roi<T> {
    pub batch_index: usize,
    pub rect: XYXY<T>,
}

impl<T> Roi<T> {
    pub fn new(batch_index: usize, rect: XYXY<T>) -> Self {
        Self { batch_index, rect }
    }
}

impl<T> Roi<T>
where
    T: Float,
{
    /// The `[batch_index, x1, y1, x2, y2]` row used by RoI pooling.
    pub fn to_row(&self) -> [T; 5] {
        let XYXY { x1, y1, x2, y2 } = self.rect;
        let batch_index = T::from(self.batch_index).unwrap();
        [batch_index, x1, y1, x2, y2]
    }

    pub fn rescale(&self, factor: T) -> Self {
        Self {
            batch_index: self.batch_index,
            rect: self.rect.rescale(factor),
        }
    }
}
