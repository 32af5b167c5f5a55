pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::prelude::*;
pub use itertools::{izip, Itertools};
pub use log::trace;
pub use std::{borrow::Borrow, iter};
pub use tch::{nn, Device, IndexOp, Kind, Tensor};
pub use tch_goodies::{RoiTensor, TensorExt};
pub use tch_tensor_like::TensorLike;
