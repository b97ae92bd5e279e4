pub mod bandwidth;
pub mod clock;
