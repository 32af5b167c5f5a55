use crate::common::*;

pub trait TensorExt {
    fn is_empty(&self) -> bool;

    fn f_sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Result<Tensor>
    where
        T: Borrow<Tensor>,
    {
        let mut iter = tensors.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| format_err!("the input iterator must not be empty"))?
            .borrow()
            .shallow_clone();
        let sum = iter.try_fold(first, |lhs, rhs| lhs.f_add(rhs.borrow()))?;
        Ok(sum)
    }

    fn sum_tensors<T>(tensors: impl IntoIterator<Item = T>) -> Tensor
    where
        T: Borrow<Tensor>,
    {
        Self::f_sum_tensors(tensors).unwrap()
    }

    /// A zero scalar that depends on every element of the tensor.
    ///
    /// Adding it to an output leaves the value unchanged while putting the
    /// tensor into the autograd graph.
    fn zero_touch(&self) -> Tensor;

    /// A zero scalar that depends on the first element of the tensor.
    fn zero_touch_first(&self) -> Tensor;

    /// Copy a `[n, N]` tensor to host memory as rows of `f32`.
    fn f_to_rows<const N: usize>(&self) -> Result<Vec<[f32; N]>>;

    fn to_rows<const N: usize>(&self) -> Vec<[f32; N]> {
        self.f_to_rows().unwrap()
    }

    /// Copy a 1-D tensor to host memory as a `Vec<f32>`.
    fn f_to_f32_vec(&self) -> Result<Vec<f32>>;

    /// Copy a 1-D tensor to host memory as a `Vec<i64>`.
    fn f_to_i64_vec(&self) -> Result<Vec<i64>>;
}

impl TensorExt for Tensor {
    fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    fn zero_touch(&self) -> Tensor {
        self.sum(Kind::Float) * 0.0
    }

    fn zero_touch_first(&self) -> Tensor {
        self.view([-1]).select(0, 0).to_kind(Kind::Float) * 0.0
    }

    fn f_to_rows<const N: usize>(&self) -> Result<Vec<[f32; N]>> {
        let (_, num_cols) = self.size2()?;
        ensure!(
            num_cols == N as i64,
            "expect a [_, {}] tensor, but get [_, {}]",
            N,
            num_cols
        );
        let values = host_values::<f32>(self, Kind::Float);
        let rows = values
            .chunks_exact(N)
            .map(|chunk| {
                let mut row = [0f32; N];
                row.copy_from_slice(chunk);
                row
            })
            .collect();
        Ok(rows)
    }

    fn f_to_f32_vec(&self) -> Result<Vec<f32>> {
        self.size1()?;
        Ok(host_values(self, Kind::Float))
    }

    fn f_to_i64_vec(&self) -> Result<Vec<i64>> {
        self.size1()?;
        Ok(host_values(self, Kind::Int64))
    }
}

fn host_values<T>(tensor: &Tensor, kind: Kind) -> Vec<T>
where
    T: tch::kind::Element,
{
    let tensor = tensor
        .detach()
        .to_device(Device::Cpu)
        .to_kind(kind)
        .contiguous();
    Vec::<T>::from(&tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_round_trip_to_host() -> Result<()> {
        let tensor = Tensor::of_slice(&[1f32, 2.0, 3.0, 4.0, 5.0, 6.0]).view([3, 2]);
        let rows: Vec<[f32; 2]> = tensor.f_to_rows()?;
        assert_eq!(rows, vec![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        assert!(tensor.f_to_rows::<3>().is_err());
        Ok(())
    }

    #[test]
    fn zero_touch_keeps_gradient_path() {
        let param = Tensor::ones(&[3, 3], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        let out = Tensor::from(2f32) + param.zero_touch_first() + param.zero_touch();
        assert_eq!(f32::from(&out), 2.0);
        out.backward();
        assert!(param.grad().defined());
        assert_eq!(f32::from(param.grad().abs().sum(Kind::Float)), 0.0);
    }
}
