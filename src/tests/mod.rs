pub mod support;

mod search;
