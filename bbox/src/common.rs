pub use anyhow::{ensure, Result};
pub use num_traits::{Float, Num, NumCast, One, ToPrimitive, Zero};
pub use std::ops::Mul;
