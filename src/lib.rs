pub mod ex;
