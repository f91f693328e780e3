pub mod renderer;

pub use renderer::FilePromptRenderer;
