pub(crate) mod available;
pub(crate) mod complete;
pub(crate) mod result;
pub(crate) mod start;
