pub mod hello_fs;
