use convnet_core::gradient_check::{eval_numerical_gradient_array, rel_error};
use convnet_core::layers::{
    affine_backward, affine_forward, conv_backward, conv_forward, conv_output_dim, dropout_forward,
    max_pool_backward, max_pool_forward, softmax_loss, spatial_batchnorm_forward, svm_loss, BatchNormParam,
    ConvParam, DropoutParam, Mode, PoolParam, RunningStats,
};
use convnet_core::LayerError;
use ndarray::{arr2, Array1, Array2, Array4, ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn wave4(shape: (usize, usize, usize, usize), freq: f64) -> Array4<f64> {
    Array4::from_shape_fn(shape, |(a, b, c, d)| {
        (((a * 1000 + b * 100 + c * 10 + d) as f64) * freq).sin()
    })
}

#[test]
fn conv_output_dims_follow_padding() {
    assert_eq!(conv_output_dim(32, 7, 3, 1).expect("same"), 32);
    assert_eq!(conv_output_dim(32, 7, 0, 1).expect("valid"), 26);
    assert!(matches!(
        conv_output_dim(32, 7, 0, 0),
        Err(LayerError::InvalidConfiguration { .. })
    ));
    assert!(matches!(
        conv_output_dim(5, 7, 0, 1),
        Err(LayerError::InvalidConfiguration { .. })
    ));
}

#[test]
fn conv_then_pool_gradient_flows_back() {
    let x = wave4((2, 3, 6, 6), 0.37);
    let w = wave4((4, 3, 3, 3), 0.91) * 0.5;
    let b = Array1::linspace(-0.1, 0.1, 4);
    let conv_param = ConvParam::same(3).expect("odd filter");
    let pool_param = PoolParam::halving();

    let (a, conv_cache) = conv_forward(&x, &w, &b, &conv_param).expect("conv");
    assert_eq!(a.dim(), (2, 4, 6, 6));
    let (out, pool_cache) = max_pool_forward(&a, &pool_param).expect("pool");
    assert_eq!(out.dim(), (2, 4, 3, 3));

    let dout = wave4((2, 4, 3, 3), 1.3);
    let da = max_pool_backward(&dout, &pool_cache).expect("pool backward");
    let (dx, dw, db) = conv_backward(&da, &conv_cache).expect("conv backward");
    assert_eq!(dx.dim(), x.dim());
    assert_eq!(dw.dim(), w.dim());
    assert_eq!(db.dim(), 4);

    let dx_num = eval_numerical_gradient_array(
        |xv| {
            let xv: Array4<f64> = xv.clone().into_dimensionality().expect("4d");
            let (a, _) = conv_forward(&xv, &w, &b, &conv_param).expect("conv");
            max_pool_forward(&a, &pool_param).expect("pool").0.into_dyn()
        },
        &x.clone().into_dyn(),
        &dout.into_dyn(),
        1e-6,
    );
    assert!(rel_error(&dx.into_dyn(), &dx_num) < 1e-6);
}

#[test]
fn affine_accepts_conv_volumes() {
    let x = wave4((3, 2, 2, 2), 0.5).into_dyn();
    let w = Array2::from_elem((8, 2), 0.25);
    let b = Array1::zeros(2);
    let (out, cache) = affine_forward(&x, &w, &b).expect("forward");
    assert_eq!(out.dim(), (3, 2));

    let (dx, _, _) = affine_backward(&Array2::ones((3, 2)), &cache).expect("backward");
    assert_eq!(dx.shape(), &[3, 2, 2, 2]);
    assert!(dx.iter().all(|&g| (g - 0.5).abs() < 1e-12));
}

#[test]
fn pooling_scenario_marks_argmaxes() {
    let x = arr2(&[
        [1.0, 2.0, 5.0, 6.0],
        [3.0, 4.0, 7.0, 8.0],
        [9.0, 1.0, 2.0, 3.0],
        [1.0, 1.0, 4.0, 2.0],
    ])
    .into_shape((1, 1, 4, 4))
    .expect("reshape");
    let (out, cache) = max_pool_forward(&x, &PoolParam::halving()).expect("forward");
    assert_eq!(
        out.index_axis(Axis(0), 0).index_axis(Axis(0), 0),
        arr2(&[[4.0, 8.0], [9.0, 4.0]])
    );
    let dx = max_pool_backward(&Array4::ones((1, 1, 2, 2)), &cache).expect("backward");
    assert_eq!(dx.sum(), 4.0);
    for &(r, c) in &[(1, 1), (1, 3), (2, 0), (3, 2)] {
        assert_eq!(dx[[0, 0, r, c]], 1.0);
    }
}

#[test]
fn spatial_batchnorm_eval_is_deterministic() {
    let x = wave4((4, 3, 2, 2), 0.77) * 3.0;
    let gamma = Array1::ones(3);
    let beta = Array1::zeros(3);
    let param = BatchNormParam::default();
    let mut stats = RunningStats::new(3);
    for _ in 0..5 {
        spatial_batchnorm_forward(&x, &gamma, &beta, &param, Mode::Train, &mut stats).expect("train");
    }
    let frozen = stats.clone();
    let (a, _) = spatial_batchnorm_forward(&x, &gamma, &beta, &param, Mode::Eval, &mut stats).expect("eval");
    let (b, _) = spatial_batchnorm_forward(&x, &gamma, &beta, &param, Mode::Eval, &mut stats).expect("eval");
    assert_eq!(a, b);
    assert_eq!(stats, frozen);
}

#[test]
fn dropout_train_and_eval_diverge() {
    let x = ArrayD::from_elem(IxDyn(&[8, 100]), 2.0);
    let param = DropoutParam::new(0.5).with_seed(3);
    let mut rng = StdRng::seed_from_u64(0);
    let (train, _) = dropout_forward(&x, &param, Mode::Train, &mut rng).expect("train");
    let (eval, _) = dropout_forward(&x, &param, Mode::Eval, &mut rng).expect("eval");
    assert_eq!(eval, x);
    assert!(train.iter().any(|&v| v == 0.0));
    assert!(train.iter().all(|&v| v == 0.0 || v == 2.0));
}

#[test]
fn losses_on_uniform_scores() {
    let scores = Array2::zeros((10, 10));
    let labels: Vec<usize> = (0..10).collect();
    let (softmax, _) = softmax_loss(&scores, &labels).expect("softmax");
    assert!((softmax - 2.3026).abs() < 1e-4);
    let (svm, _) = svm_loss(&scores, &labels).expect("svm");
    assert!((svm - 9.0).abs() < 1e-12);
}

#[test]
fn mode_strings() {
    assert_eq!("train".parse::<Mode>(), Ok(Mode::Train));
    assert_eq!("test".parse::<Mode>(), Ok(Mode::Eval));
    assert!(matches!("predict".parse::<Mode>(), Err(LayerError::InvalidMode(_))));
}
