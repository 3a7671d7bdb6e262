pub mod geops;
