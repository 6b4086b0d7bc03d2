mod file;

pub use file::FileKv;
