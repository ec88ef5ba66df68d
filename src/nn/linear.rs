use crate::nn::{fetch, Context, Module};
use crate::ops;
use crate::pmpack::PMPack;
use crate::tensor::{DType, Tensor, TensorMap};

/// `y = x @ weight^T + bias`. `weight` is `[out,in]`; loaded either dense
/// (`F32`) or `QInt4F32` (stored pre-transposed, so the quantized path never
/// needs a logical transpose — see `ops::matmul_qint4`).
pub struct Linear {
    weight: Tensor,
    bias: Tensor,
    in_features: i64,
    out_features: i64,
}

impl Linear {
    pub fn new(in_features: i64, out_features: i64) -> Self {
        Self {
            weight: Tensor::zeros_f32(&[out_features, in_features]),
            bias: Tensor::zeros_f32(&[out_features]),
            in_features,
            out_features,
        }
    }

    pub fn in_features(&self) -> i64 {
        self.in_features
    }

    pub fn out_features(&self) -> i64 {
        self.out_features
    }

    /// 1-D input is treated as a single row (GEMV), 2-D as GEMM, `>=3`-D as
    /// BMM — all three fold into `ops::matmul`'s batch handling once the
    /// 1-D case is unsqueezed to a `[1, in]` row.
    pub fn forward(&self, pm: &mut PMPack, x: &Tensor) -> Tensor {
        let rank = x.rank();
        let x2 = if rank == 1 { x.unsqueeze(0) } else { x.clone() };

        let y = match self.weight.dtype() {
            DType::F32 => {
                let wt = self.weight.transpose(0, 1);
                ops::matmul(pm, &x2, &wt)
            }
            DType::QInt4F32 => ops::matmul_qint4(pm, &x2, &self.weight).expect("Linear: qint4 matmul failed"),
            other => panic!("Linear: unsupported weight dtype {other:?}"),
        };
        let y = ops::add(&y, &self.bias);
        if rank == 1 {
            y.squeeze(0)
        } else {
            y
        }
    }
}

impl Module for Linear {
    fn init_parameters(&mut self, ctx: &Context, params: &TensorMap) {
        let weight = fetch(params, &ctx.name("weight"));
        assert_eq!(weight.dim(0), self.out_features, "Linear: weight out_features mismatch");
        assert_eq!(weight.dim(1), self.in_features, "Linear: weight in_features mismatch");
        self.weight = weight.clone();

        let bias = fetch(params, &ctx.name("bias"));
        assert_eq!(bias.dim(0), self.out_features, "Linear: bias length mismatch");
        self.bias = bias.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime;
    use std::collections::HashMap;

    fn setup() -> PMPack {
        runtime::init();
        PMPack::new()
    }

    #[test]
    fn forward_matches_manual_matmul_plus_bias() {
        let mut pm = setup();
        let mut lin = Linear::new(3, 2);
        let mut params = HashMap::new();
        params.insert("weight".to_string(), Tensor::from_f32_vec(&[2, 3], vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]));
        params.insert("bias".to_string(), Tensor::from_f32_vec(&[2], vec![10.0, 20.0]));
        lin.init_parameters(&Context::root(), &params);

        let x = Tensor::from_f32_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let y = lin.forward(&mut pm, &x);
        assert_eq!(y.dims(), vec![2, 2]);
        assert_eq!(y.raw_f32(), &[11.0, 22.0, 14.0, 25.0]);
    }

    #[test]
    fn forward_1d_input_squeezes_back_to_1d() {
        let mut pm = setup();
        let mut lin = Linear::new(3, 2);
        let mut params = HashMap::new();
        params.insert("weight".to_string(), Tensor::from_f32_vec(&[2, 3], vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]));
        params.insert("bias".to_string(), Tensor::from_f32_vec(&[2], vec![0.0, 0.0]));
        lin.init_parameters(&Context::root(), &params);

        let x = Tensor::from_f32_vec(&[3], vec![1.0, 2.0, 3.0]);
        let y = lin.forward(&mut pm, &x);
        assert_eq!(y.rank(), 1);
        assert_eq!(y.raw_f32(), &[1.0, 2.0]);
    }

    #[test]
    #[should_panic(expected = "missing parameter tensor")]
    fn init_parameters_panics_on_missing_weight() {
        let mut lin = Linear::new(3, 2);
        let params = HashMap::new();
        lin.init_parameters(&Context::root(), &params);
    }
}
