pub mod fix_filestreams;
