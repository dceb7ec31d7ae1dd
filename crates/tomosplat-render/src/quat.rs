use burn::tensor::{Tensor, backend::Backend};

/// Rotation matrices `[N, 3, 3]` from unit quaternions `[N, 4]` in
/// `(w, x, y, z)` order.
pub fn quat_to_rotmat<B: Backend>(quats: Tensor<B, 2>) -> Tensor<B, 3> {
    let n = quats.dims()[0];
    let w = quats.clone().slice([0..n, 0..1]);
    let x = quats.clone().slice([0..n, 1..2]);
    let y = quats.clone().slice([0..n, 2..3]);
    let z = quats.slice([0..n, 3..4]);

    let xx = x.clone() * x.clone();
    let yy = y.clone() * y.clone();
    let zz = z.clone() * z.clone();
    let xy = x.clone() * y.clone();
    let xz = x.clone() * z.clone();
    let yz = y.clone() * z.clone();
    let wx = w.clone() * x;
    let wy = w.clone() * y;
    let wz = w * z;

    let row0 = Tensor::cat(
        vec![
            (yy.clone() + zz.clone()) * -2.0 + 1.0,
            (xy.clone() - wz.clone()) * 2.0,
            (xz.clone() + wy.clone()) * 2.0,
        ],
        1,
    );
    let row1 = Tensor::cat(
        vec![
            (xy + wz) * 2.0,
            (xx.clone() + zz) * -2.0 + 1.0,
            (yz.clone() - wx.clone()) * 2.0,
        ],
        1,
    );
    let row2 = Tensor::cat(
        vec![(xz - wy) * 2.0, (yz + wx) * 2.0, (xx + yy) * -2.0 + 1.0],
        1,
    );

    Tensor::stack::<3>(vec![row0, row1, row2], 1)
}

/// Covariance basis `M = R diag(s)`, `[N, 3, 3]`, so that `Σ = M Mᵀ`.
pub fn quat_scale_to_basis<B: Backend>(
    quats: Tensor<B, 2>,
    scales: Tensor<B, 2>,
) -> Tensor<B, 3> {
    let rot = quat_to_rotmat(quats);
    rot * scales.unsqueeze_dim::<3>(1)
}

/// Expand `[N, 6]` packed upper-triangular coefficients into full symmetric
/// matrices `[N, 3, 3]`. Packing order: `(xx, xy, xz, yy, yz, zz)`.
pub fn unpack_sym3<B: Backend>(cov6: Tensor<B, 2>) -> Tensor<B, 3> {
    let n = cov6.dims()[0];
    let xx = cov6.clone().slice([0..n, 0..1]);
    let xy = cov6.clone().slice([0..n, 1..2]);
    let xz = cov6.clone().slice([0..n, 2..3]);
    let yy = cov6.clone().slice([0..n, 3..4]);
    let yz = cov6.clone().slice([0..n, 4..5]);
    let zz = cov6.slice([0..n, 5..6]);

    let row0 = Tensor::cat(vec![xx, xy.clone(), xz.clone()], 1);
    let row1 = Tensor::cat(vec![xy, yy, yz.clone()], 1);
    let row2 = Tensor::cat(vec![xz, yz, zz], 1);
    Tensor::stack::<3>(vec![row0, row1, row2], 1)
}

/// Invert symmetric `[N, 3, 3]` matrices through the adjugate. Degenerate
/// inputs are not guarded; the determinant is clamped away from zero only to
/// avoid division blowups.
pub fn invert_sym3<B: Backend>(mats: Tensor<B, 3>) -> Tensor<B, 3> {
    let n = mats.dims()[0];
    let el = |i: usize, j: usize| {
        mats.clone()
            .slice([0..n, i..i + 1, j..j + 1])
            .reshape([n, 1])
    };
    let a = el(0, 0);
    let b = el(0, 1);
    let c = el(0, 2);
    let d = el(1, 1);
    let e = el(1, 2);
    let f = el(2, 2);

    let co_a = d.clone() * f.clone() - e.clone() * e.clone();
    let co_b = c.clone() * e.clone() - b.clone() * f.clone();
    let co_c = b.clone() * e.clone() - c.clone() * d.clone();
    let co_d = a.clone() * f.clone() - c.clone() * c.clone();
    let co_e = b.clone() * c.clone() - a.clone() * e.clone();
    let co_f = a.clone() * d.clone() - b.clone() * b.clone();

    let det = (a * co_a.clone() + b * co_b.clone() + c * co_c.clone()).clamp_min(1e-24);

    let row0 = Tensor::cat(vec![co_a.clone(), co_b.clone(), co_c.clone()], 1);
    let row1 = Tensor::cat(vec![co_b, co_d, co_e.clone()], 1);
    let row2 = Tensor::cat(vec![co_c, co_e, co_f], 1);
    let adj = Tensor::stack::<3>(vec![row0, row1, row2], 1);
    adj / det.unsqueeze_dim::<3>(2)
}
