pub mod settings;
pub mod comparators;
pub mod find_many;
