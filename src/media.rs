//! Extension-based media-type guessing and file-format ontology terms.

const EDAM: &str = "http://edamontology.org/";

fn primary_type(ext: &str) -> Option<&'static str> {
    let media = match ext {
        "txt" | "text" | "log" => "text/plain",
        "csv" => "text/csv",
        "tsv" | "tab" => "text/tab-separated-values",
        "htm" | "html" => "text/html",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "svg" => "image/svg+xml",
        _ => return None,
    };
    Some(media)
}

fn encoding(ext: &str) -> Option<&'static str> {
    match ext {
        "gz" | "tgz" => Some("gzip"),
        "bz2" => Some("bzip2"),
        "xz" => Some("xz"),
        "Z" => Some("compress"),
        "br" => Some("br"),
        _ => None,
    }
}

/// Fallback for formats the generic table does not know about.
fn domain_type(ext: &str) -> Option<&'static str> {
    match ext {
        "fasta" | "fa" | "fna" | "faa" => Some("chemical/seq-na-fasta"),
        "fastq" | "fq" => Some("chemical/seq-na-fastq"),
        "pdb" => Some("chemical/x-pdb"),
        "cif" | "mmcif" => Some("chemical/x-mmcif"),
        "bam" | "sra" => Some("application/octet-stream"),
        "sam" | "vcf" | "gff" | "gff3" | "gtf" | "bed" => Some("text/plain"),
        _ => None,
    }
}

/// EDAM format term for a file extension (without the leading dot).
pub fn conforms_to(ext: &str) -> Option<String> {
    let term = match ext.to_ascii_lowercase().as_str() {
        "csv" => "format_3752",
        "tsv" | "tab" => "format_3475",
        "txt" | "text" => "format_2330",
        "json" => "format_3464",
        "xml" => "format_2332",
        "pdf" => "format_3508",
        "png" => "format_3603",
        "jpg" | "jpeg" => "format_3579",
        "tif" | "tiff" => "format_3591",
        "fasta" | "fa" | "fna" | "faa" => "format_1929",
        "fastq" | "fq" => "format_1930",
        "bam" => "format_2572",
        "sam" => "format_2573",
        "vcf" => "format_3016",
        "gff" | "gff3" => "format_1975",
        "bed" => "format_3003",
        "zip" => "format_3987",
        "gz" => "format_3989",
        _ => return None,
    };
    Some(format!("{EDAM}{term}"))
}

/// Last extension of a file name or URL path, ignoring any query string or fragment.
pub fn extension(name: &str) -> Option<&str> {
    let path = name.split(['?', '#']).next().unwrap_or(name);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext)
}

/// Guesses a media type from the extensions of `name`.
///
/// A trailing compression extension is reported as an encoding; when both a
/// type and an encoding are known they are joined as `type+encoding`.
pub fn guess(name: &str) -> Option<String> {
    let path = name.split(['?', '#']).next().unwrap_or(name);
    let file = path.rsplit('/').next().unwrap_or(path);
    let mut parts = file.split('.').skip(1).collect::<Vec<_>>();
    let last = parts.pop()?;

    let (media, enc) = match encoding(last) {
        Some(enc) if last == "tgz" => (Some("application/x-tar"), Some(enc)),
        Some(enc) => (parts.last().and_then(|ext| lookup(ext)), Some(enc)),
        None => (lookup(last), None),
    };
    match (media, enc) {
        (Some(media), Some(enc)) => Some(format!("{media}+{enc}")),
        (Some(media), None) => Some(media.to_string()),
        (None, Some(enc)) => Some(enc.to_string()),
        (None, None) => None,
    }
}

fn lookup(ext: &str) -> Option<&'static str> {
    let lower = ext.to_ascii_lowercase();
    primary_type(&lower).or_else(|| domain_type(&lower))
}

/// Media type and conformance term for a file that is described by `source`
/// (usually its URL) and stored as `filename`.
pub fn describe(source: &str, filename: &str) -> (Option<String>, Option<String>) {
    let media = guess(source).or_else(|| guess(filename));
    let conforms = extension(filename).and_then(conforms_to);
    (media, conforms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guess_simple_and_compound() {
        assert_eq!(guess("a/b/table.csv").as_deref(), Some("text/csv"));
        assert_eq!(guess("reads.csv.gz").as_deref(), Some("text/csv+gzip"));
        assert_eq!(guess("blob.gz").as_deref(), Some("gzip"));
        assert_eq!(guess("https://h/x/seq.fasta?dl=1").as_deref(), Some("chemical/seq-na-fasta"));
        assert_eq!(guess("noext"), None);
    }

    #[test]
    fn conformance_terms() {
        assert_eq!(
            conforms_to("csv").as_deref(),
            Some("http://edamontology.org/format_3752")
        );
        assert_eq!(conforms_to("unknown"), None);
    }

    #[test]
    fn extension_ignores_query() {
        assert_eq!(extension("https://h/p/file.txt?x=1"), Some("txt"));
        assert_eq!(extension(".hidden"), None);
    }
}
