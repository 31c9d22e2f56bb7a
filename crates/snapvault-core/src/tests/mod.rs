mod helpers;
mod meta;
