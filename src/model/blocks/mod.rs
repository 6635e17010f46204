pub mod conv;
pub mod residual;
pub mod upsample;

pub use conv::ConvBlock;
pub use residual::ResidualBlock;
pub use upsample::upsample_route;
