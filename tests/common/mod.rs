#![allow(dead_code)]

use graph_reverse::ops::{Activation, ActivationKind, Add, Dense, Value};
use graph_reverse::{GraphBuilder, Layer, LayerRef, Model, Result, ReverseHandler, ReverseMappingRegistry, TensorId};
use ndarray::{Array, Array2, IxDyn};
use rand::Rng;

pub fn linear(name: &str) -> LayerRef {
    Layer::new(name, Activation::new(ActivationKind::Linear))
}

pub fn dense(name: &str, rows: usize, cols: usize, activation: ActivationKind) -> LayerRef {
    let kernel = Array2::from_shape_fn((rows, cols), |(i, j)| 0.1 * (i as f32 + 1.0) - 0.05 * j as f32);
    Layer::new(name, Dense::new(kernel).with_activation(activation))
}

/// x -> tanh -> ... -> tanh, returning the model and all tensors in order
pub fn chain(length: usize) -> Result<(Model, Vec<TensorId>)> {
    let mut b = GraphBuilder::new("chain");
    let x = b.input("x")?;
    let mut tensors = vec![x];
    for i in 0..length {
        let layer = Layer::new(format!("tanh_{}", i), Activation::new(ActivationKind::Tanh));
        let last = tensors[tensors.len() - 1];
        tensors.push(b.apply_one(&layer, &[last])?);
    }
    let y = tensors[tensors.len() - 1];
    Ok((b.build(&[x], &[y])?, tensors))
}

/// x -> (left, right) -> add
pub fn diamond() -> Result<Model> {
    let mut b = GraphBuilder::new("diamond");
    let x = b.input("x")?;
    let l = b.apply_one(&linear("left"), &[x])?;
    let r = b.apply_one(&linear("right"), &[x])?;
    let y = b.apply_one(&Layer::new("merge", Add), &[l, r])?;
    b.build(&[x], &[y])
}

/// dense -> [dense -> relu] -> dense, the bracket being a nested model
pub fn nested() -> Result<Model> {
    let mut inner = GraphBuilder::new("block");
    let ix = inner.input("block_in")?;
    let h = inner.apply_one(&dense("block_dense", 4, 4, ActivationKind::Linear), &[ix])?;
    let iy = inner.apply_one(&Layer::new("block_relu", Activation::new(ActivationKind::Relu)), &[h])?;
    let block = Layer::container("block", inner.build(&[ix], &[iy])?);

    let mut outer = GraphBuilder::new("outer");
    let x = outer.input("x")?;
    let a = outer.apply_one(&dense("pre", 3, 4, ActivationKind::Tanh), &[x])?;
    let b = outer.apply_one(&block, &[a])?;
    let y = outer.apply_one(&dense("post", 4, 2, ActivationKind::Linear), &[b])?;
    outer.build(&[x], &[y])
}

/// x -> shared -> shared, one layer applied at two nodes
pub fn shared_layer() -> Result<(Model, LayerRef)> {
    let shared = linear("shared");
    let mut b = GraphBuilder::new("shared");
    let x = b.input("x")?;
    let h = b.apply_one(&shared, &[x])?;
    let y = b.apply_one(&shared, &[h])?;
    Ok((b.build(&[x], &[y])?, shared))
}

/// Hands the first reversed output to every input
pub fn pass_through() -> ReverseHandler {
    ReverseHandler::function(|xs, _ys, reversed_ys, _ctx| Ok(xs.iter().map(|_| reversed_ys[0].clone()).collect()))
}

pub fn pass_through_registry() -> ReverseMappingRegistry {
    ReverseMappingRegistry::new().with_default(pass_through())
}

pub fn random_value(shape: &[usize]) -> Value {
    let mut rng = rand::thread_rng();
    Array::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-1.0..1.0))
}
