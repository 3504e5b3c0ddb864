pub mod align_dnaseq;
