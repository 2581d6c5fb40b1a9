mod directory;
mod proxy;

pub use directory::ContactDirectory;
pub use proxy::StreamTubeProxy;
