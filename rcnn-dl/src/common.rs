pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::prelude::*;
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use itertools::{izip, Itertools as _};
pub use log::{debug, warn};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    iter,
    path::{Path, PathBuf},
};
pub use tch::{Device, IndexOp, Kind, Tensor};
pub use tch_goodies::{BoxTensor, RoiTensor, TensorExt as _};
pub use tch_tensor_like::TensorLike;
