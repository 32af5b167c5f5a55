use crate::common::*;

/// Draw `amount` distinct indexes from `0..length` in random order.
pub fn random_indexes<R>(rng: &mut R, length: usize, amount: usize) -> Result<Vec<i64>>
where
    R: Rng + ?Sized,
{
    ensure!(
        amount <= length,
        "cannot draw {} indexes out of {}",
        amount,
        length
    );
    let indexes = rand::seq::index::sample(rng, length, amount)
        .into_iter()
        .map(|index| index as i64)
        .collect();
    Ok(indexes)
}

/// Uniformly pick `amount` elements of a 1-D `gallery` without replacement.
pub fn random_choice<R>(rng: &mut R, gallery: &Tensor, amount: usize) -> Result<Tensor>
where
    R: Rng + ?Sized,
{
    let length = gallery
        .size1()
        .map_err(|_| format_err!("gallery should be a 1d tensor"))?;
    let indexes = random_indexes(rng, length as usize, amount)?;
    let indexes = Tensor::of_slice(&indexes).to_device(gallery.device());
    Ok(gallery.index_select(0, &indexes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorExt as _;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn random_choice_picks_distinct_gallery_elements() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let gallery = Tensor::of_slice(&[10i64, 11, 12, 13, 14, 15]);
        let picked = random_choice(&mut rng, &gallery, 4)?.f_to_i64_vec()?;
        assert_eq!(picked.len(), 4);
        assert_eq!(picked.iter().unique().count(), 4);
        assert!(picked.iter().all(|value| (10..16).contains(value)));
        Ok(())
    }

    #[test]
    fn same_seed_same_choice() -> Result<()> {
        let gallery = Tensor::arange(100, tch::kind::INT64_CPU);
        let lhs = random_choice(&mut StdRng::seed_from_u64(1), &gallery, 10)?.f_to_i64_vec()?;
        let rhs = random_choice(&mut StdRng::seed_from_u64(1), &gallery, 10)?.f_to_i64_vec()?;
        assert_eq!(lhs, rhs);
        Ok(())
    }

    #[test]
    fn oversized_request_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let gallery = Tensor::of_slice(&[1i64, 2]);
        assert!(random_choice(&mut rng, &gallery, 3).is_err());
        assert!(random_choice(&mut rng, &gallery, 0).is_ok());
    }
}
