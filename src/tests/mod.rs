mod fakes;
mod search;
