pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{prelude::*, Roi, XYXY};
pub use getset::Getters;
pub use itertools::{izip, Itertools};
pub use log::trace;
pub use rand::Rng;
pub use std::{
    borrow::Borrow,
    convert::{TryFrom, TryInto},
    iter,
};
pub use tch::{Device, IndexOp, Kind, Tensor};
pub use tch_tensor_like::TensorLike;
