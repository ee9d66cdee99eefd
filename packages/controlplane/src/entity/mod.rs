pub mod autoretrieve;
pub mod content;
pub mod deal;
pub mod obj_ref;
pub mod object;
pub mod shuttle;
