use crate::{common::*, tensor::TensorExt};

/// Checked tensor of boxes in `[num_boxes, 4]` (x1, y1, x2, y2) layout.
#[derive(Debug, TensorLike, Getters)]
pub struct BoxTensor {
    #[get = "pub"]
    pub(crate) boxes: Tensor,
}

impl BoxTensor {
    pub fn empty(device: Device) -> Self {
        Self {
            boxes: Tensor::zeros(&[0, 4], (Kind::Float, device)),
        }
    }

    pub fn num_boxes(&self) -> i64 {
        self.boxes.size()[0]
    }

    pub fn device(&self) -> Device {
        self.boxes.device()
    }

    pub fn x1(&self) -> Tensor {
        self.boxes.select(1, 0)
    }

    pub fn y1(&self) -> Tensor {
        self.boxes.select(1, 1)
    }

    pub fn x2(&self) -> Tensor {
        self.boxes.select(1, 2)
    }

    pub fn y2(&self) -> Tensor {
        self.boxes.select(1, 3)
    }

    pub fn w(&self) -> Tensor {
        self.x2() - self.x1()
    }

    pub fn h(&self) -> Tensor {
        self.y2() - self.y1()
    }

    /// The `sqrt(w * h)` scale of each box in shape `[num_boxes]`.
    pub fn scale(&self) -> Tensor {
        (self.w() * self.h()).sqrt()
    }

    pub fn index_select(&self, indexes: &Tensor) -> Self {
        Self {
            boxes: self.boxes.index_select(0, indexes),
        }
    }

    /// Concatenate box sets along the first dimension.
    pub fn cat<B>(boxes: &[B]) -> Self
    where
        B: Borrow<BoxTensor>,
    {
        let tensors: Vec<_> = boxes.iter().map(|b| b.borrow().boxes.shallow_clone()).collect();
        Self {
            boxes: Tensor::cat(&tensors, 0),
        }
    }

    /// Scale width and height of every box by `factor` around its center.
    pub fn rescale(&self, factor: f64) -> Self {
        let cx = (self.x1() + self.x2()) * 0.5;
        let cy = (self.y1() + self.y2()) * 0.5;
        let half_w = self.w() * (factor * 0.5);
        let half_h = self.h() * (factor * 0.5);
        let boxes = Tensor::stack(
            &[&cx - &half_w, &cy - &half_h, &cx + &half_w, &cy + &half_h],
            1,
        );
        Self { boxes }
    }

    /// Copy boxes to host memory. Inverted boxes are clamped to zero size.
    ///
    /// Fails if any coordinate is not finite.
    pub fn f_to_xyxy_vec(&self) -> Result<Vec<XYXY<f32>>> {
        self.boxes
            .f_to_rows::<4>()?
            .into_iter()
            .enumerate()
            .map(|(index, [x1, y1, x2, y2])| {
                ensure!(
                    [x1, y1, x2, y2].iter().all(|value| value.is_finite()),
                    "box {} has non-finite coordinates {:?}",
                    index,
                    [x1, y1, x2, y2]
                );
                XYXY::try_from_xyxy([x1, y1, x2.max(x1), y2.max(y1)])
            })
            .collect()
    }

    pub fn to_xyxy_vec(&self) -> Vec<XYXY<f32>> {
        self.f_to_xyxy_vec().unwrap()
    }
}

impl TryFrom<Tensor> for BoxTensor {
    type Error = Error;

    fn try_from(boxes: Tensor) -> Result<Self, Self::Error> {
        let (_, num_cols) = boxes.size2()?;
        ensure!(num_cols == 4, "expect a [_, 4] box tensor, but get [_, {}]", num_cols);
        ensure!(
            is_float_kind(boxes.kind()),
            "box tensor must be of floating point kind, but get {:?}",
            boxes.kind()
        );
        Ok(Self { boxes })
    }
}

impl TryFrom<&Tensor> for BoxTensor {
    type Error = Error;

    fn try_from(boxes: &Tensor) -> Result<Self, Self::Error> {
        boxes.shallow_clone().try_into()
    }
}

impl From<BoxTensor> for Tensor {
    fn from(from: BoxTensor) -> Self {
        from.boxes
    }
}

impl<R> From<&[R]> for BoxTensor
where
    R: Rect<Type = f32>,
{
    fn from(from: &[R]) -> Self {
        let values: Vec<f32> = from
            .iter()
            .flat_map(|rect| [rect.x1(), rect.y1(), rect.x2(), rect.y2()])
            .collect();
        let boxes = Tensor::of_slice(&values).view([from.len() as i64, 4]);
        Self { boxes }
    }
}

pub(crate) fn is_float_kind(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Half | Kind::Float | Kind::Double | Kind::BFloat16
    )
}
