use candle_core::{DType, Device, IndexOp, Tensor};
use sbi_util::tensor_util::*;
use sbi_util::SbiError;

fn counting(dims: &[usize]) -> anyhow::Result<Tensor> {
    let n: usize = dims.iter().product();
    let x = Tensor::arange(0u32, n as u32, &Device::Cpu)?
        .to_dtype(DType::F32)?
        .reshape(dims)?;
    Ok(x)
}

fn same(a: &Tensor, b: &Tensor) -> anyhow::Result<bool> {
    Ok(a.dims() == b.dims()
        && a.flatten_all()?.to_vec1::<f32>()? == b.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn split_leading_dim_shapes() -> anyhow::Result<()> {
    let x = counting(&[24, 5])?;
    assert!(same(&split_leading_dim(&x, &[-1])?, &x)?);
    assert_eq!(split_leading_dim(&x, &[2, -1])?.dims(), &[2, 12, 5]);
    assert_eq!(split_leading_dim(&x, &[2, 3, -1])?.dims(), &[2, 3, 4, 5]);
    assert_eq!(split_leading_dim(&x, &[4, 6])?.dims(), &[4, 6, 5]);

    assert!(matches!(
        split_leading_dim(&x, &[]),
        Err(SbiError::InvalidArgument(_))
    ));
    assert!(matches!(
        split_leading_dim(&x, &[5, 5]),
        Err(SbiError::Shape(_))
    ));
    assert!(matches!(
        split_leading_dim(&x, &[5, -1]),
        Err(SbiError::Shape(_))
    ));
    assert!(matches!(
        split_leading_dim(&x, &[-1, -1]),
        Err(SbiError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn merge_leading_dims_shapes() -> anyhow::Result<()> {
    let x = counting(&[2, 3, 4, 5])?;
    assert!(same(&merge_leading_dims(&x, 1)?, &x)?);
    assert_eq!(merge_leading_dims(&x, 2)?.dims(), &[6, 4, 5]);
    assert_eq!(merge_leading_dims(&x, 3)?.dims(), &[24, 5]);
    assert_eq!(merge_leading_dims(&x, 4)?.dims(), &[120]);

    assert!(matches!(
        merge_leading_dims(&x, 0),
        Err(SbiError::InvalidArgument(_))
    ));
    assert!(matches!(
        merge_leading_dims(&x, 5),
        Err(SbiError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn split_undoes_merge() -> anyhow::Result<()> {
    let x = Tensor::randn(0f32, 1f32, (2, 3, 4, 5), &Device::Cpu)?;
    let cases: [(usize, Vec<isize>); 6] = [
        (1, vec![2]),
        (2, vec![2, 3]),
        (3, vec![2, 3, 4]),
        (4, vec![2, 3, 4, 5]),
        (2, vec![2, -1]),
        (3, vec![-1, 3, 4]),
    ];
    for (k, shape) in cases.iter() {
        let y = split_leading_dim(&merge_leading_dims(&x, *k)?, shape)?;
        assert!(same(&y, &x)?, "k = {}, shape = {:?}", k, shape);
    }
    Ok(())
}

#[test]
fn repeat_rows_keeps_rows_together() -> anyhow::Result<()> {
    let x = counting(&[3, 2, 4])?;
    assert!(same(&repeat_rows(&x, 1)?, &x)?);

    let n = 4;
    let y = repeat_rows(&x, n)?;
    assert_eq!(y.dims(), &[12, 2, 4]);
    for i in 0..3 {
        for j in 0..n {
            assert!(same(&y.i(i * n + j)?, &x.i(i)?)?, "row {} copy {}", i, j);
        }
    }

    assert!(matches!(
        repeat_rows(&x, 0),
        Err(SbiError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn tile_cycles_the_flattened_tensor() -> anyhow::Result<()> {
    let x = counting(&[3])?;
    let y = tile(&x, 3)?;
    assert_eq!(
        y.to_vec1::<f32>()?,
        vec![0., 1., 2., 0., 1., 2., 0., 1., 2.]
    );
    assert!(matches!(tile(&x, 0), Err(SbiError::InvalidArgument(_))));
    Ok(())
}
