pub mod candle_aux_layers;
pub mod candle_frame_decoder;
pub mod candle_frame_encoder;
pub mod candle_gaussian;
pub mod candle_loss_functions;
pub mod candle_model_traits;
pub mod candle_optim_chain;
pub mod candle_rng_key;
pub mod candle_vae;
pub mod candle_vae_inference;
pub mod candle_vae_sampling;

pub use candle_core;
pub use candle_nn;
