use super::XYXY;
use crate::common::*;

/// The generic rectangle in image pixel space.
pub trait Rect {
    type Type;

    fn x1(&self) -> Self::Type;
    fn y1(&self) -> Self::Type;
    fn x2(&self) -> Self::Type;
    fn y2(&self) -> Self::Type;
    fn cx(&self) -> Self::Type;
    fn cy(&self) -> Self::Type;
    fn w(&self) -> Self::Type;
    fn h(&self) -> Self::Type;

    fn try_from_xyxy(xyxy: [Self::Type; 4]) -> Result<Self>
    where
        Self: Sized;
}

pub trait RectNum: Rect
where
    Self::Type: Num + PartialOrd,
{
    fn from_xyxy(xyxy: [Self::Type; 4]) -> Self
    where
        Self: Sized,
    {
        Self::try_from_xyxy(xyxy).unwrap()
    }

    fn xyxy(&self) -> [Self::Type; 4] {
        [self.x1(), self.y1(), self.x2(), self.y2()]
    }

    fn cxcywh(&self) -> [Self::Type; 4] {
        [self.cx(), self.cy(), self.w(), self.h()]
    }

    fn to_xyxy(&self) -> XYXY<Self::Type> {
        XYXY {
            x1: self.x1(),
            y1: self.y1(),
            x2: self.x2(),
            y2: self.y2(),
        }
    }

    fn area(&self) -> <Self::Type as Mul<Self::Type>>::Output
    where
        Self::Type: Mul<Self::Type>,
    {
        self.w() * self.h()
    }

    /// Returns true if `x2 > x1` and `y2 > y1`.
    fn is_valid(&self) -> bool {
        self.x2() > self.x1() && self.y2() > self.y1()
    }
}

pub trait RectFloat: RectNum
where
    Self::Type: Float,
{
    fn intersect_with<R>(&self, other: &R) -> Option<XYXY<Self::Type>>
    where
        R: Rect<Type = Self::Type>,
    {
        let x1 = self.x1().max(other.x1());
        let y1 = self.y1().max(other.y1());
        let x2 = self.x2().min(other.x2());
        let y2 = self.y2().min(other.y2());
        (x2 > x1 && y2 > y1).then(|| XYXY { x1, y1, x2, y2 })
    }

    fn intersection_area_with<R>(&self, other: &R) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        self.intersect_with(other)
            .map(|rect| rect.area())
            .unwrap_or_else(Self::Type::zero)
    }

    fn iou_with<R>(&self, other: &R, epsilon: Self::Type) -> Self::Type
    where
        R: Rect<Type = Self::Type>,
    {
        let inter_area = self.intersection_area_with(other);
        let union_area = self.area() + other.area() - inter_area + epsilon;
        inter_area / union_area
    }

    /// The geometric mean of width and height, `sqrt(w * h)`.
    fn scale(&self) -> Self::Type {
        (self.w() * self.h()).sqrt()
    }

    /// Scale width and height by `factor` while keeping the center fixed.
    fn rescale(&self, factor: Self::Type) -> XYXY<Self::Type> {
        let two = Self::Type::one() + Self::Type::one();
        let [cx, cy, w, h] = self.cxcywh();
        let half_w = w * factor / two;
        let half_h = h * factor / two;
        XYXY {
            x1: cx - half_w,
            y1: cy - half_h,
            x2: cx + half_w,
            y2: cy + half_h,
        }
    }
}

impl<T> RectNum for T
where
    T: Rect,
    T::Type: Num + PartialOrd,
{
}

impl<T> RectFloat for T
where
    T: Rect,
    T::Type: Float,
{
}

/// Drops boxes with non-positive width or height.
///
/// Degenerate boxes are removed rather than clipped to zero area.
pub fn retain_valid<R, I>(boxes: I) -> Vec<R>
where
    I: IntoIterator<Item = R>,
    R: Rect,
    R::Type: Num + PartialOrd,
{
    boxes.into_iter().filter(|rect| rect.is_valid()).collect()
}
