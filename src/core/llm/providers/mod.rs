pub mod openai;
#[cfg(test)]
pub mod scripted;

pub use openai::OpenAiProvider;
