mod publish;
mod utils;
