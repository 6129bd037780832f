//! The fifteen parameter groups of the LSTM, as a closed set.
//!
//! `LstmParams<T>` is used three ways: store ids (`LstmParams<String>`), the
//! weights loaded for a step, and the gradient set (`LstmParams<Tensor>`).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::ComputeEngine;
use crate::error::Result;
use crate::pool::TensorPool;
use crate::tensor::{Shape, Tensor};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LstmDims {
    pub vocab_size: usize,
    pub embed_size: usize,
    pub hidden_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamName {
    Embedding,
    WForget,
    WInput,
    WCell,
    WOutput,
    UForget,
    UInput,
    UCell,
    UOutput,
    BForget,
    BInput,
    BCell,
    BOutput,
    WOut,
    BOut,
}

impl ParamName {
    pub const ALL: [ParamName; 15] = [
        ParamName::Embedding,
        ParamName::WForget,
        ParamName::WInput,
        ParamName::WCell,
        ParamName::WOutput,
        ParamName::UForget,
        ParamName::UInput,
        ParamName::UCell,
        ParamName::UOutput,
        ParamName::BForget,
        ParamName::BInput,
        ParamName::BCell,
        ParamName::BOutput,
        ParamName::WOut,
        ParamName::BOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ParamName::Embedding => "embedding",
            ParamName::WForget => "w_f",
            ParamName::WInput => "w_i",
            ParamName::WCell => "w_c",
            ParamName::WOutput => "w_o",
            ParamName::UForget => "u_f",
            ParamName::UInput => "u_i",
            ParamName::UCell => "u_c",
            ParamName::UOutput => "u_o",
            ParamName::BForget => "b_f",
            ParamName::BInput => "b_i",
            ParamName::BCell => "b_c",
            ParamName::BOutput => "b_o",
            ParamName::WOut => "w_y",
            ParamName::BOut => "b_y",
        }
    }

    pub fn from_name(s: &str) -> Option<ParamName> {
        ParamName::ALL.iter().copied().find(|p| p.as_str() == s)
    }

    /// Optimizer layer id: position in `ALL`.
    pub fn layer_id(self) -> usize {
        self as usize
    }

    pub fn shape(self, dims: &LstmDims) -> Shape {
        let (v, e, h) = (dims.vocab_size, dims.embed_size, dims.hidden_size);
        match self {
            ParamName::Embedding => Shape::matrix(v, e),
            ParamName::WForget | ParamName::WInput | ParamName::WCell | ParamName::WOutput => {
                Shape::matrix(e, h)
            }
            ParamName::UForget | ParamName::UInput | ParamName::UCell | ParamName::UOutput => {
                Shape::matrix(h, h)
            }
            ParamName::BForget | ParamName::BInput | ParamName::BCell | ParamName::BOutput => {
                Shape::matrix(1, h)
            }
            ParamName::WOut => Shape::matrix(h, v),
            ParamName::BOut => Shape::matrix(1, v),
        }
    }

    pub fn is_bias(self) -> bool {
        matches!(
            self,
            ParamName::BForget | ParamName::BInput | ParamName::BCell | ParamName::BOutput | ParamName::BOut
        )
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LstmParams<T> {
    pub embedding: T,
    pub w_f: T,
    pub w_i: T,
    pub w_c: T,
    pub w_o: T,
    pub u_f: T,
    pub u_i: T,
    pub u_c: T,
    pub u_o: T,
    pub b_f: T,
    pub b_i: T,
    pub b_c: T,
    pub b_o: T,
    pub w_y: T,
    pub b_y: T,
}

/// Fifteen accumulators, one per parameter group.
pub type GradientSet = LstmParams<Tensor>;

impl<T> LstmParams<T> {
    pub fn try_build(mut f: impl FnMut(ParamName) -> Result<T>) -> Result<Self> {
        Ok(LstmParams {
            embedding: f(ParamName::Embedding)?,
            w_f: f(ParamName::WForget)?,
            w_i: f(ParamName::WInput)?,
            w_c: f(ParamName::WCell)?,
            w_o: f(ParamName::WOutput)?,
            u_f: f(ParamName::UForget)?,
            u_i: f(ParamName::UInput)?,
            u_c: f(ParamName::UCell)?,
            u_o: f(ParamName::UOutput)?,
            b_f: f(ParamName::BForget)?,
            b_i: f(ParamName::BInput)?,
            b_c: f(ParamName::BCell)?,
            b_o: f(ParamName::BOutput)?,
            w_y: f(ParamName::WOut)?,
            b_y: f(ParamName::BOut)?,
        })
    }

    pub fn get(&self, name: ParamName) -> &T {
        match name {
            ParamName::Embedding => &self.embedding,
            ParamName::WForget => &self.w_f,
            ParamName::WInput => &self.w_i,
            ParamName::WCell => &self.w_c,
            ParamName::WOutput => &self.w_o,
            ParamName::UForget => &self.u_f,
            ParamName::UInput => &self.u_i,
            ParamName::UCell => &self.u_c,
            ParamName::UOutput => &self.u_o,
            ParamName::BForget => &self.b_f,
            ParamName::BInput => &self.b_i,
            ParamName::BCell => &self.b_c,
            ParamName::BOutput => &self.b_o,
            ParamName::WOut => &self.w_y,
            ParamName::BOut => &self.b_y,
        }
    }

    pub fn get_mut(&mut self, name: ParamName) -> &mut T {
        match name {
            ParamName::Embedding => &mut self.embedding,
            ParamName::WForget => &mut self.w_f,
            ParamName::WInput => &mut self.w_i,
            ParamName::WCell => &mut self.w_c,
            ParamName::WOutput => &mut self.w_o,
            ParamName::UForget => &mut self.u_f,
            ParamName::UInput => &mut self.u_i,
            ParamName::UCell => &mut self.u_c,
            ParamName::UOutput => &mut self.u_o,
            ParamName::BForget => &mut self.b_f,
            ParamName::BInput => &mut self.b_i,
            ParamName::BCell => &mut self.b_c,
            ParamName::BOutput => &mut self.b_o,
            ParamName::WOut => &mut self.w_y,
            ParamName::BOut => &mut self.b_y,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ParamName, &T)> + '_ {
        ParamName::ALL.iter().map(move |&p| (p, self.get(p)))
    }

    pub fn into_vec(self) -> Vec<(ParamName, T)> {
        vec![
            (ParamName::Embedding, self.embedding),
            (ParamName::WForget, self.w_f),
            (ParamName::WInput, self.w_i),
            (ParamName::WCell, self.w_c),
            (ParamName::WOutput, self.w_o),
            (ParamName::UForget, self.u_f),
            (ParamName::UInput, self.u_i),
            (ParamName::UCell, self.u_c),
            (ParamName::UOutput, self.u_o),
            (ParamName::BForget, self.b_f),
            (ParamName::BInput, self.b_i),
            (ParamName::BCell, self.b_c),
            (ParamName::BOutput, self.b_o),
            (ParamName::WOut, self.w_y),
            (ParamName::BOut, self.b_y),
        ]
    }
}

impl LstmParams<Tensor> {
    /// Fifteen pool-rented, zero-filled tensors shaped like the parameters.
    pub fn zeroed<E: ComputeEngine>(pool: &mut TensorPool<E>, dims: &LstmDims) -> Result<Self> {
        LstmParams::try_build(|p| pool.rent_zeroed(&p.shape(dims)))
    }

    pub fn release_into<E: ComputeEngine>(self, pool: &mut TensorPool<E>) {
        pool.release_all(self.into_vec().into_iter().map(|(_, t)| t));
    }

    pub fn to_host<E: ComputeEngine>(&self, engine: &E) -> LstmParams<Vec<f32>> {
        engine.synchronize();
        LstmParams {
            embedding: engine.to_host(&self.embedding),
            w_f: engine.to_host(&self.w_f),
            w_i: engine.to_host(&self.w_i),
            w_c: engine.to_host(&self.w_c),
            w_o: engine.to_host(&self.w_o),
            u_f: engine.to_host(&self.u_f),
            u_i: engine.to_host(&self.u_i),
            u_c: engine.to_host(&self.u_c),
            u_o: engine.to_host(&self.u_o),
            b_f: engine.to_host(&self.b_f),
            b_i: engine.to_host(&self.b_i),
            b_c: engine.to_host(&self.b_c),
            b_o: engine.to_host(&self.b_o),
            w_y: engine.to_host(&self.w_y),
            b_y: engine.to_host(&self.b_y),
        }
    }

    /// Global L2 norm across all fifteen tensors.
    pub fn global_norm<E: ComputeEngine>(&self, engine: &E) -> f32 {
        engine.synchronize();
        let sq: f64 = self.iter().map(|(_, t)| engine.sum_squares(t)).sum();
        sq.sqrt() as f32
    }
}
