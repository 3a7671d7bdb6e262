pub mod feed;
pub mod stations;
pub mod timetable;
