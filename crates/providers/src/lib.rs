pub mod kobold;
